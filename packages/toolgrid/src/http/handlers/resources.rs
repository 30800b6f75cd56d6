use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use utoipa::ToSchema;

use toolgrid_types::{ErrorCode, RequestContext, ResourceEntry};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceRequest {
    pub uri: String,
}

#[utoipa::path(get, path = "/resources", responses((status = 200, description = "Unified resource listing")))]
#[axum::debug_handler]
pub async fn handle_list_resources(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<Vec<ResourceEntry>>>> {
    let mut resources = state.gateway.registries.resources.all();
    resources.sort_by(|a, b| a.uri.cmp(&b.uri));
    Ok(Envelope::ok(resources, Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/resources/read", responses((status = 200, description = "Resource contents")))]
#[axum::debug_handler]
pub async fn handle_read_resource(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<ReadResourceRequest>,
) -> HttpResult<impl IntoResponse> {
    let entry = state
        .gateway
        .registries
        .resources
        .find(&req.uri)
        .ok_or_else(|| HttpError::not_found(format!("Resource not found: {}", req.uri)))?;

    let client = state.gateway.pool.client(&entry.server_id).ok_or_else(|| {
        HttpError::new(ErrorCode::ServerDisconnected, "Server not connected")
            .with_request_id(ctx.request_id.clone())
    })?;

    let contents = client.read_resource(&req.uri).await.map_err(|err| {
        HttpError::new(err.code, format!("Resource read failed: {}", err.message))
            .with_request_id(ctx.request_id.clone())
    })?;

    state.gateway.registries.resources.record_usage(&req.uri);
    Ok(Envelope::ok(contents, Some(ctx.request_id)))
}
