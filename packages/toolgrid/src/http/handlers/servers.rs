use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use toolgrid_types::{
    AuditEntry, ConnectionStatus, GroupId, HealthCheckConfig, RateLimitConfig, RequestContext,
    ServerAuth, ServerConfig, ServerGroup, ServerId, ServerMetadata, ToolEntry, TransportConfig,
};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateServerRequest {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub auth: Option<ServerAuth>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub rate_limits: Option<RateLimitConfig>,
    #[serde(default)]
    pub metadata: Option<ServerMetadata>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub auth: Option<ServerAuth>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub rate_limits: Option<RateLimitConfig>,
    #[serde(default)]
    pub metadata: Option<ServerMetadata>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[utoipa::path(post, path = "/servers", responses((status = 200, description = "Server created")))]
#[axum::debug_handler]
pub async fn handle_create_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateServerRequest>,
) -> HttpResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(HttpError::validation("server name must not be empty"));
    }

    let server = ServerConfig {
        id: ServerId::generate(),
        name: req.name,
        transport: req.transport,
        auth: req.auth,
        health_check: req.health_check.unwrap_or_default(),
        rate_limits: req.rate_limits.unwrap_or_default(),
        metadata: req.metadata.unwrap_or_default(),
        group_id: req.group_id,
        enabled: req.enabled.unwrap_or(true),
    };

    state.gateway.server_store.insert(&server)?;
    state.gateway.http_metrics.increment_registered_servers();
    record_admin_audit(&state, &ctx, "server.create", &server.id, true);

    Ok(Envelope::ok(server, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/servers", responses((status = 200, description = "List servers")))]
#[axum::debug_handler]
pub async fn handle_list_servers(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let servers = state.gateway.server_store.list()?;
    let data: Vec<serde_json::Value> = servers
        .into_iter()
        .map(|server| {
            let status = state.gateway.pool.status(&server.id);
            json!({"server": server, "connection": status})
        })
        .collect();
    Ok(Envelope::ok(data, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/servers/{id}", responses((status = 200, description = "Server detail")))]
#[axum::debug_handler]
pub async fn handle_get_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    let server = state
        .gateway
        .server_store
        .get(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Server not found: {id}")))?;

    let data = json!({
        "server": server,
        "connection": state.gateway.pool.status(&id),
        "breaker": state.gateway.breakers.snapshot(&id),
        "rateLimit": state.gateway.limiter.snapshot(&id),
    });
    Ok(Envelope::ok(data, Some(ctx.request_id)))
}

#[utoipa::path(put, path = "/servers/{id}", responses((status = 200, description = "Server updated")))]
#[axum::debug_handler]
pub async fn handle_update_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
    Json(req): Json<UpdateServerRequest>,
) -> HttpResult<impl IntoResponse> {
    let mut server = state
        .gateway
        .server_store
        .get(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Server not found: {id}")))?;

    if let Some(name) = req.name {
        server.name = name;
    }
    if let Some(transport) = req.transport {
        server.transport = transport;
    }
    if let Some(auth) = req.auth {
        server.auth = Some(auth);
    }
    if let Some(health_check) = req.health_check {
        server.health_check = health_check;
    }
    if let Some(rate_limits) = req.rate_limits {
        server.rate_limits = rate_limits;
    }
    if let Some(metadata) = req.metadata {
        server.metadata = metadata;
    }
    if let Some(group_id) = req.group_id {
        server.group_id = Some(group_id);
    }
    if let Some(enabled) = req.enabled {
        server.enabled = enabled;
    }

    state.gateway.server_store.update(&server)?;

    // runtime projections follow the stored row
    state
        .gateway
        .limiter
        .register(server.id.clone(), server.rate_limits);
    if !server.enabled {
        state.gateway.pool.disconnect(&server.id).await;
    }

    record_admin_audit(&state, &ctx, "server.update", &server.id, true);
    Ok(Envelope::ok(server, Some(ctx.request_id)))
}

#[utoipa::path(delete, path = "/servers/{id}", responses((status = 200, description = "Server deleted")))]
#[axum::debug_handler]
pub async fn handle_delete_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    let deleted = state.gateway.delete_server(&id).await?;
    if !deleted {
        return Err(HttpError::not_found(format!("Server not found: {id}")));
    }
    state.gateway.http_metrics.decrement_registered_servers();
    record_admin_audit(&state, &ctx, "server.delete", &id, true);
    Ok(Envelope::ok(json!({"deleted": true}), Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/servers/{id}/connect", responses((status = 200, description = "Connection status")))]
#[axum::debug_handler]
pub async fn handle_connect_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<Json<Envelope<ConnectionStatus>>> {
    let status = state.gateway.connect_server(&id).await.map_err(|err| {
        record_admin_audit(&state, &ctx, "server.connect", &id, false);
        HttpError::from(err)
    })?;
    record_admin_audit(&state, &ctx, "server.connect", &id, true);
    Ok(Envelope::ok(status, Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/servers/{id}/disconnect", responses((status = 200, description = "Disconnected")))]
#[axum::debug_handler]
pub async fn handle_disconnect_server(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    state.gateway.disconnect_server(&id).await?;
    record_admin_audit(&state, &ctx, "server.disconnect", &id, true);
    Ok(Envelope::ok(
        json!({"disconnected": true}),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/servers/{id}/tools", responses((status = 200, description = "Tools of one server")))]
#[axum::debug_handler]
pub async fn handle_server_tools(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<Json<Envelope<Vec<ToolEntry>>>> {
    if state.gateway.server_store.get(&id)?.is_none() {
        return Err(HttpError::not_found(format!("Server not found: {id}")));
    }
    let mut tools = state.gateway.registries.tools.find_by_server(&id);
    tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
    Ok(Envelope::ok(tools, Some(ctx.request_id)))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[utoipa::path(post, path = "/servers/groups", responses((status = 200, description = "Group created")))]
#[axum::debug_handler]
pub async fn handle_create_group(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<CreateGroupRequest>,
) -> HttpResult<Json<crate::http::types::Envelope<ServerGroup>>> {
    if req.name.trim().is_empty() {
        return Err(HttpError::validation("group name must not be empty"));
    }
    let group = ServerGroup {
        id: GroupId::generate(),
        name: req.name,
        description: req.description,
    };
    state.gateway.server_store.insert_group(&group)?;
    Ok(Envelope::ok(group, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/servers/groups", responses((status = 200, description = "List groups")))]
#[axum::debug_handler]
pub async fn handle_list_groups(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<crate::http::types::Envelope<Vec<ServerGroup>>>> {
    Ok(Envelope::ok(
        state.gateway.server_store.list_groups()?,
        Some(ctx.request_id),
    ))
}

fn record_admin_audit(
    state: &HttpState,
    ctx: &RequestContext,
    action: &str,
    server_id: &ServerId,
    success: bool,
) {
    let entry = AuditEntry {
        id: uuid::Uuid::new_v4().simple().to_string(),
        timestamp: Utc::now(),
        action: action.to_string(),
        resource_type: "server".to_string(),
        resource_id: Some(server_id.to_string()),
        api_key_id: ctx.principal.api_key_id.clone(),
        tenant_id: ctx.principal.tenant_id.clone(),
        ip_address: None,
        user_agent: None,
        duration_ms: None,
        success,
        details: json!({"requestId": ctx.request_id}),
    };
    if let Err(err) = state.gateway.audit_store.append(&entry) {
        tracing::warn!(?err, "failed to append audit row");
    }
}
