use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use toolgrid_types::{RequestContext, ToolEntry};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;
use crate::router::BatchItem;

#[derive(Debug, Deserialize)]
pub struct ListToolsQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBatchRequest {
    pub items: Vec<BatchItem>,
}

#[utoipa::path(get, path = "/tools", responses((status = 200, description = "Unified tool listing")))]
#[axum::debug_handler]
pub async fn handle_list_tools(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<ListToolsQuery>,
) -> HttpResult<Json<Envelope<Vec<ToolEntry>>>> {
    let registries = &state.gateway.registries;
    let mut tools = match (&query.category, &query.tag) {
        (Some(category), _) => registries.tools.find_by_category(category),
        (None, Some(tag)) => registries.tools.find_by_tag(tag),
        (None, None) => registries.tools.all(),
    };
    tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
    Ok(Envelope::ok(tools, Some(ctx.request_id)))
}

/// Successful invocations return the outcome in the envelope; admission
/// denials surface as their mapped status (429/503/...) with the retry
/// hint in `Retry-After`.
#[utoipa::path(post, path = "/tools/invoke", responses((status = 200, description = "Invocation outcome")))]
#[axum::debug_handler]
pub async fn handle_invoke_tool(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<InvokeRequest>,
) -> HttpResult<impl IntoResponse> {
    let outcome = state.gateway.router.invoke(&ctx, &req.name, req.params).await;

    if outcome.success {
        return Ok(Envelope::ok(outcome, Some(ctx.request_id)));
    }

    let code = outcome.code.unwrap_or(toolgrid_types::ErrorCode::Internal);
    Err(HttpError::new(
        code,
        outcome
            .error
            .unwrap_or_else(|| "invocation failed".to_string()),
    )
    .with_retry_after(outcome.retry_after_ms)
    .with_request_id(ctx.request_id.clone()))
}

/// Batch items run concurrently and report independently; the response
/// is always 200 with per-item outcomes in input order.
#[utoipa::path(post, path = "/tools/invoke-batch", responses((status = 200, description = "Batch outcomes")))]
#[axum::debug_handler]
pub async fn handle_invoke_batch(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<InvokeBatchRequest>,
) -> HttpResult<impl IntoResponse> {
    if req.items.is_empty() {
        return Err(HttpError::validation("batch must contain at least one item"));
    }

    let outcomes = state.gateway.router.invoke_batch(&ctx, req.items).await;
    Ok(Envelope::ok(outcomes, Some(ctx.request_id)))
}
