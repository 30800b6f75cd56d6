use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use toolgrid_types::{
    ExecutionId, RequestContext, Workflow, WorkflowDefinition, WorkflowExecution, WorkflowId,
};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub definition: WorkflowDefinition,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkflowRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub definition: Option<WorkflowDefinition>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsQuery {
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// Round-trippable export: `load(export(W)) = W`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportWorkflowRequest {
    pub name: String,
    pub definition: WorkflowDefinition,
}

#[utoipa::path(post, path = "/workflows", responses((status = 200, description = "Workflow created")))]
#[axum::debug_handler]
pub async fn handle_create_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateWorkflowRequest>,
) -> HttpResult<Json<Envelope<Workflow>>> {
    if req.name.trim().is_empty() {
        return Err(HttpError::validation("workflow name must not be empty"));
    }
    let workflow = state
        .gateway
        .workflow_store
        .insert(&req.name, &req.definition)?;
    Ok(Envelope::ok(workflow, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/workflows", responses((status = 200, description = "List workflows")))]
#[axum::debug_handler]
pub async fn handle_list_workflows(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<Vec<Workflow>>>> {
    Ok(Envelope::ok(
        state.gateway.workflow_store.list()?,
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/workflows/{id}", responses((status = 200, description = "Workflow detail")))]
#[axum::debug_handler]
pub async fn handle_get_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<WorkflowId>,
) -> HttpResult<Json<Envelope<Workflow>>> {
    let workflow = state
        .gateway
        .workflow_store
        .get(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Workflow not found: {id}")))?;
    Ok(Envelope::ok(workflow, Some(ctx.request_id)))
}

#[utoipa::path(put, path = "/workflows/{id}", responses((status = 200, description = "Workflow updated")))]
#[axum::debug_handler]
pub async fn handle_update_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<WorkflowId>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> HttpResult<Json<Envelope<Workflow>>> {
    let workflow = state.gateway.workflow_store.update(
        &id,
        req.name.as_deref(),
        req.definition.as_ref(),
        req.enabled,
    )?;
    Ok(Envelope::ok(workflow, Some(ctx.request_id)))
}

#[utoipa::path(delete, path = "/workflows/{id}", responses((status = 200, description = "Workflow deleted")))]
#[axum::debug_handler]
pub async fn handle_delete_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<WorkflowId>,
) -> HttpResult<impl IntoResponse> {
    if !state.gateway.workflow_store.delete(&id)? {
        return Err(HttpError::not_found(format!("Workflow not found: {id}")));
    }
    Ok(Envelope::ok(json!({"deleted": true}), Some(ctx.request_id)))
}

/// Starts a background execution and returns the pending row; the run
/// continues after this response.
#[utoipa::path(post, path = "/workflows/{id}/execute", responses((status = 200, description = "Execution started")))]
#[axum::debug_handler]
pub async fn handle_execute_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<WorkflowId>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> HttpResult<Json<Envelope<WorkflowExecution>>> {
    let execution = state
        .gateway
        .workflow_manager
        .start(&state.app, &ctx, &id, req.input)?;
    Ok(Envelope::ok(execution, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/workflows/executions", responses((status = 200, description = "List executions")))]
#[axum::debug_handler]
pub async fn handle_list_executions(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<ListExecutionsQuery>,
) -> HttpResult<Json<Envelope<Vec<WorkflowExecution>>>> {
    let executions = state.gateway.workflow_manager.list_executions(
        query.workflow_id.as_ref(),
        query.limit.unwrap_or(50).min(500),
        query.offset.unwrap_or(0),
    )?;
    Ok(Envelope::ok(executions, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/workflows/executions/{id}", responses((status = 200, description = "Execution with steps")))]
#[axum::debug_handler]
pub async fn handle_get_execution(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ExecutionId>,
) -> HttpResult<impl IntoResponse> {
    let (execution, steps) = state
        .gateway
        .workflow_manager
        .get_execution(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Execution not found: {id}")))?;
    Ok(Envelope::ok(
        json!({"execution": execution, "steps": steps}),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(post, path = "/workflows/executions/{id}/cancel", responses((status = 200, description = "Cancellation requested")))]
#[axum::debug_handler]
pub async fn handle_cancel_execution(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ExecutionId>,
) -> HttpResult<impl IntoResponse> {
    let cancelled = state.gateway.workflow_manager.cancel(&id);
    if !cancelled {
        return Err(HttpError::not_found(format!(
            "No running execution to cancel: {id}"
        )));
    }
    Ok(Envelope::ok(json!({"cancelled": true}), Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/workflows/{id}/export", responses((status = 200, description = "Exported workflow")))]
#[axum::debug_handler]
pub async fn handle_export_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<WorkflowId>,
) -> HttpResult<impl IntoResponse> {
    let workflow = state
        .gateway
        .workflow_store
        .get(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Workflow not found: {id}")))?;
    Ok(Envelope::ok(
        json!({"name": workflow.name, "definition": workflow.definition}),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(post, path = "/workflows/import", responses((status = 200, description = "Imported workflow")))]
#[axum::debug_handler]
pub async fn handle_import_workflow(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<ImportWorkflowRequest>,
) -> HttpResult<Json<Envelope<Workflow>>> {
    let workflow = state
        .gateway
        .workflow_store
        .insert(&req.name, &req.definition)?;
    Ok(Envelope::ok(workflow, Some(ctx.request_id)))
}
