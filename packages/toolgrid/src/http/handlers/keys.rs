use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use toolgrid_types::{ApiKeyId, RequestContext, TenantId};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeyRequest {
    pub enabled: bool,
}

/// The plaintext key appears exactly once, in this response; only its
/// hash is stored.
#[utoipa::path(post, path = "/keys", responses((status = 200, description = "Key created")))]
#[axum::debug_handler]
pub async fn handle_create_key(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateKeyRequest>,
) -> HttpResult<impl IntoResponse> {
    if !ctx.principal.is_master {
        return Err(HttpError::new(
            toolgrid_types::ErrorCode::Forbidden,
            "only the master key can manage API keys",
        ));
    }
    if req.name.trim().is_empty() {
        return Err(HttpError::validation("key name must not be empty"));
    }

    let plaintext = format!("tg_{}", uuid::Uuid::new_v4().simple());
    let record = state
        .gateway
        .api_key_store
        .insert(&req.name, &plaintext, req.tenant_id)?;

    Ok(Envelope::ok(
        json!({
            "id": record.id,
            "name": record.name,
            "tenantId": record.tenant_id,
            "key": plaintext,
            "createdAt": record.created_at,
        }),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/keys", responses((status = 200, description = "List keys")))]
#[axum::debug_handler]
pub async fn handle_list_keys(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let keys: Vec<serde_json::Value> = state
        .gateway
        .api_key_store
        .list()?
        .into_iter()
        .map(|record| {
            json!({
                "id": record.id,
                "name": record.name,
                "tenantId": record.tenant_id,
                "enabled": record.enabled,
                "createdAt": record.created_at,
                "lastUsedAt": record.last_used_at,
            })
        })
        .collect();
    Ok(Envelope::ok(keys, Some(ctx.request_id)))
}

#[utoipa::path(put, path = "/keys/{id}", responses((status = 200, description = "Key updated")))]
#[axum::debug_handler]
pub async fn handle_update_key(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ApiKeyId>,
    Json(req): Json<UpdateKeyRequest>,
) -> HttpResult<impl IntoResponse> {
    if !ctx.principal.is_master {
        return Err(HttpError::new(
            toolgrid_types::ErrorCode::Forbidden,
            "only the master key can manage API keys",
        ));
    }
    if !state.gateway.api_key_store.set_enabled(&id, req.enabled)? {
        return Err(HttpError::not_found(format!("Key not found: {id}")));
    }
    Ok(Envelope::ok(
        json!({"id": id, "enabled": req.enabled}),
        Some(ctx.request_id),
    ))
}
