use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use toolgrid_types::{split_qualified_name, ErrorCode, PromptEntry, RequestContext};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[utoipa::path(get, path = "/prompts", responses((status = 200, description = "Unified prompt listing")))]
#[axum::debug_handler]
pub async fn handle_list_prompts(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<Vec<PromptEntry>>>> {
    let mut prompts = state.gateway.registries.prompts.all();
    prompts.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
    Ok(Envelope::ok(prompts, Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/prompts/get", responses((status = 200, description = "Rendered prompt")))]
#[axum::debug_handler]
pub async fn handle_get_prompt(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<GetPromptRequest>,
) -> HttpResult<impl IntoResponse> {
    let entry = state
        .gateway
        .registries
        .prompts
        .find(&req.name)
        .ok_or_else(|| HttpError::not_found(format!("Prompt not found: {}", req.name)))?;

    let client = state.gateway.pool.client(&entry.server_id).ok_or_else(|| {
        HttpError::new(ErrorCode::ServerDisconnected, "Server not connected")
            .with_request_id(ctx.request_id.clone())
    })?;

    let local_name = split_qualified_name(&req.name)
        .map(|(_, local)| local)
        .unwrap_or(req.name.as_str());

    let prompt = client.get_prompt(local_name, req.args).await.map_err(|err| {
        HttpError::new(err.code, format!("Prompt fetch failed: {}", err.message))
            .with_request_id(ctx.request_id.clone())
    })?;

    state.gateway.registries.prompts.record_usage(&req.name);
    Ok(Envelope::ok(prompt, Some(ctx.request_id)))
}
