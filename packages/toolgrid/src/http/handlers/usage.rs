use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use toolgrid_types::{ApiKeyId, RequestContext, ServerId, TenantId, UsageQuery, UsageSummary};

use crate::http::error::HttpResult;
use crate::http::state::HttpState;
use crate::http::types::Envelope;

use super::audit::CleanupRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageQueryParams {
    #[serde(default)]
    pub api_key_id: Option<ApiKeyId>,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

impl UsageQueryParams {
    fn to_query(&self) -> UsageQuery {
        UsageQuery {
            api_key_id: self.api_key_id.clone(),
            tenant_id: self.tenant_id.clone(),
            server_id: self.server_id.clone(),
            action_type: self.action_type.clone(),
            from: self.from,
            to: self.to,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[utoipa::path(get, path = "/usage", responses((status = 200, description = "Usage records")))]
#[axum::debug_handler]
pub async fn handle_query_usage(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<UsageQueryParams>,
) -> HttpResult<impl IntoResponse> {
    let records = state.gateway.usage_store.query(&params.to_query())?;
    Ok(Envelope::ok(records, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/usage/summary", responses((status = 200, description = "Aggregated usage")))]
#[axum::debug_handler]
pub async fn handle_usage_summary(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(params): Query<UsageQueryParams>,
) -> HttpResult<Json<Envelope<UsageSummary>>> {
    let summary = state.gateway.usage_store.summary(&params.to_query())?;
    Ok(Envelope::ok(summary, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/usage/export", responses((status = 200, description = "Usage export (csv)")))]
#[axum::debug_handler]
pub async fn handle_export_usage(
    State(state): State<HttpState>,
    Extension(_ctx): Extension<RequestContext>,
    Query(params): Query<UsageQueryParams>,
) -> HttpResult<impl IntoResponse> {
    let body = state.gateway.usage_store.export_csv(&params.to_query())?;
    Ok(([(header::CONTENT_TYPE, "text/csv")], body))
}

#[utoipa::path(post, path = "/usage/cleanup", responses((status = 200, description = "Rows purged")))]
#[axum::debug_handler]
pub async fn handle_cleanup_usage(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CleanupRequest>,
) -> HttpResult<impl IntoResponse> {
    let deleted = state.gateway.usage_store.cleanup(req.older_than_days)?;
    Ok(Envelope::ok(json!({"deleted": deleted}), Some(ctx.request_id)))
}
