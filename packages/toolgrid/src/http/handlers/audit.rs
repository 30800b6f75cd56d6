use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use toolgrid_types::{ApiKeyId, AuditEntry, AuditQuery, RequestContext, TenantId};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQueryParams {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub api_key_id: Option<ApiKeyId>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    /// For `/audit/export`: `json` (default) or `csv`.
    #[serde(default)]
    pub format: Option<String>,
}

impl AuditQueryParams {
    fn to_query(&self) -> AuditQuery {
        AuditQuery {
            action: self.action.clone(),
            resource_type: self.resource_type.clone(),
            api_key_id: self.api_key_id.clone(),
            tenant_id: self.tenant_id.clone(),
            success: self.success,
            from: self.from,
            to: self.to,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[utoipa::path(get, path = "/audit", responses((status = 200, description = "Audit entries")))]
#[axum::debug_handler]
pub async fn handle_query_audit(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<AuditQueryParams>,
) -> HttpResult<impl IntoResponse> {
    let query = params.to_query();
    let entries: Vec<AuditEntry> = state.gateway.audit_store.query(&query)?;
    let total = state.gateway.audit_store.count(&query)?;
    Ok(Envelope::ok(
        json!({"entries": entries, "total": total}),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/audit/export", responses((status = 200, description = "Audit export (json or csv)")))]
#[axum::debug_handler]
pub async fn handle_export_audit(
    State(state): State<HttpState>,
    Extension(_ctx): Extension<RequestContext>,
    Query(params): Query<AuditQueryParams>,
) -> HttpResult<impl IntoResponse> {
    let query = params.to_query();
    match params.format.as_deref().unwrap_or("json") {
        "json" => {
            let body = state.gateway.audit_store.export_json(&query)?;
            Ok(([(header::CONTENT_TYPE, "application/json")], body))
        }
        "csv" => {
            let body = state.gateway.audit_store.export_csv(&query)?;
            Ok(([(header::CONTENT_TYPE, "text/csv")], body))
        }
        other => Err(HttpError::validation(format!(
            "unknown export format: {other}"
        ))),
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub older_than_days: u32,
}

#[utoipa::path(post, path = "/audit/cleanup", responses((status = 200, description = "Rows purged")))]
#[axum::debug_handler]
pub async fn handle_cleanup_audit(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CleanupRequest>,
) -> HttpResult<impl IntoResponse> {
    let deleted = state.gateway.audit_store.cleanup(req.older_than_days)?;
    Ok(Envelope::ok(json!({"deleted": deleted}), Some(ctx.request_id)))
}
