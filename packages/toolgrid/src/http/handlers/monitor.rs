use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;

use toolgrid_types::{RequestContext, ServerId};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

/// Public liveness probe; no auth, minimal body.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
#[axum::debug_handler]
pub async fn handle_health(State(state): State<HttpState>) -> impl IntoResponse {
    let healthy = state.gateway.health_status.read().unwrap().is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"healthy": healthy})))
}

#[utoipa::path(get, path = "/monitor/health", responses((status = 200, description = "Per-server health")))]
#[axum::debug_handler]
pub async fn handle_monitor_health(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let health = state.gateway.health_status.read().unwrap().clone();
    let connections = state.gateway.pool.statuses();
    Ok(Envelope::ok(
        json!({"health": health, "connections": connections}),
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/monitor/circuit-breakers", responses((status = 200, description = "Breaker snapshots")))]
#[axum::debug_handler]
pub async fn handle_monitor_breakers(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let mut snapshots = state.gateway.breakers.snapshots();
    snapshots.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    Ok(Envelope::ok(snapshots, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/monitor/rate-limits", responses((status = 200, description = "Rate limit snapshots")))]
#[axum::debug_handler]
pub async fn handle_monitor_rate_limits(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let limiter = &state.gateway.limiter;
    let mut servers = limiter.registered();
    servers.sort();

    let snapshots: Vec<serde_json::Value> = servers
        .into_iter()
        .filter_map(|server_id| {
            limiter
                .snapshot(&server_id)
                .map(|decision| json!({"serverId": server_id, "window": decision}))
        })
        .collect();
    Ok(Envelope::ok(snapshots, Some(ctx.request_id)))
}

/// Administrative override: reject all traffic to one upstream until
/// forced closed or the breaker times out into its probe state.
#[utoipa::path(post, path = "/monitor/circuit-breakers/{id}/force-open", responses((status = 200, description = "Breaker forced open")))]
#[axum::debug_handler]
pub async fn handle_force_open(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    if state.gateway.breakers.snapshot(&id).is_none() {
        return Err(HttpError::not_found(format!("No breaker for server: {id}")));
    }
    state.gateway.breakers.force_open(&id);
    Ok(Envelope::ok(json!({"state": "open"}), Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/monitor/circuit-breakers/{id}/force-close", responses((status = 200, description = "Breaker forced closed")))]
#[axum::debug_handler]
pub async fn handle_force_close(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    if state.gateway.breakers.snapshot(&id).is_none() {
        return Err(HttpError::not_found(format!("No breaker for server: {id}")));
    }
    state.gateway.breakers.force_close(&id);
    Ok(Envelope::ok(json!({"state": "closed"}), Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/monitor/rate-limits/{id}/reset", responses((status = 200, description = "Window counters reset")))]
#[axum::debug_handler]
pub async fn handle_reset_rate_limit(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<ServerId>,
) -> HttpResult<impl IntoResponse> {
    if state.gateway.limiter.snapshot(&id).is_none() {
        return Err(HttpError::not_found(format!(
            "No rate limit config for server: {id}"
        )));
    }
    state.gateway.limiter.reset(&id);
    Ok(Envelope::ok(json!({"reset": true}), Some(ctx.request_id)))
}

#[utoipa::path(post, path = "/monitor/rate-limits/reset", responses((status = 200, description = "All window counters reset")))]
#[axum::debug_handler]
pub async fn handle_reset_all_rate_limits(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    state.gateway.limiter.reset_all();
    Ok(Envelope::ok(json!({"reset": true}), Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/monitor/metrics", responses((status = 200, description = "Runtime counters")))]
#[axum::debug_handler]
pub async fn handle_monitor_metrics(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<impl IntoResponse> {
    let gateway = &state.gateway;
    let connections = gateway.pool.statuses();
    let connected = connections
        .iter()
        .filter(|c| c.state == toolgrid_types::ConnectionState::Connected)
        .count();
    let delivery_stats = gateway.webhooks.get_stats()?;

    Ok(Envelope::ok(
        json!({
            "servers": {
                "total": connections.len(),
                "connected": connected,
            },
            "registry": {
                "tools": gateway.registries.tools.count(),
                "resources": gateway.registries.resources.count(),
                "prompts": gateway.registries.prompts.count(),
            },
            "webhooks": delivery_stats,
            "semanticSearch": gateway.semantic.enabled(),
        }),
        Some(ctx.request_id),
    ))
}
