use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use utoipa::ToSchema;

use toolgrid_types::{
    DeliveryStats, RequestContext, ServerId, SubscriptionId, WebhookDelivery, WebhookSubscription,
};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::Envelope;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub server_filter: Vec<ServerId>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDeliveriesQuery {
    #[serde(default)]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

fn validate(req: &SubscriptionRequest) -> HttpResult<()> {
    if req.name.trim().is_empty() {
        return Err(HttpError::validation("subscription name must not be empty"));
    }
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(HttpError::validation("url must be http(s)"));
    }
    if req.events.is_empty() {
        return Err(HttpError::validation("at least one event kind is required"));
    }
    Ok(())
}

#[utoipa::path(post, path = "/webhooks/subscriptions", responses((status = 200, description = "Subscription created")))]
#[axum::debug_handler]
pub async fn handle_create_subscription(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<SubscriptionRequest>,
) -> HttpResult<Json<Envelope<WebhookSubscription>>> {
    validate(&req)?;

    let sub = WebhookSubscription {
        id: SubscriptionId::generate(),
        name: req.name,
        url: req.url,
        events: req.events,
        secret: req.secret,
        enabled: req.enabled,
        server_filter: req.server_filter,
        retry_count: req.retry_count,
        retry_delay_ms: req.retry_delay_ms,
        timeout_ms: req.timeout_ms,
    };
    state.gateway.webhooks.create_subscription(&sub)?;
    Ok(Envelope::ok(sub, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/webhooks/subscriptions", responses((status = 200, description = "List subscriptions")))]
#[axum::debug_handler]
pub async fn handle_list_subscriptions(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<Vec<WebhookSubscription>>>> {
    Ok(Envelope::ok(
        state.gateway.webhooks.list_subscriptions()?,
        Some(ctx.request_id),
    ))
}

#[utoipa::path(get, path = "/webhooks/subscriptions/{id}", responses((status = 200, description = "Subscription detail")))]
#[axum::debug_handler]
pub async fn handle_get_subscription(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<SubscriptionId>,
) -> HttpResult<Json<Envelope<WebhookSubscription>>> {
    let sub = state
        .gateway
        .webhooks
        .get_subscription(&id)?
        .ok_or_else(|| HttpError::not_found(format!("Subscription not found: {id}")))?;
    Ok(Envelope::ok(sub, Some(ctx.request_id)))
}

#[utoipa::path(put, path = "/webhooks/subscriptions/{id}", responses((status = 200, description = "Subscription updated")))]
#[axum::debug_handler]
pub async fn handle_update_subscription(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<SubscriptionId>,
    Json(req): Json<SubscriptionRequest>,
) -> HttpResult<Json<Envelope<WebhookSubscription>>> {
    validate(&req)?;

    let sub = WebhookSubscription {
        id,
        name: req.name,
        url: req.url,
        events: req.events,
        secret: req.secret,
        enabled: req.enabled,
        server_filter: req.server_filter,
        retry_count: req.retry_count,
        retry_delay_ms: req.retry_delay_ms,
        timeout_ms: req.timeout_ms,
    };
    state.gateway.webhooks.update_subscription(&sub)?;
    Ok(Envelope::ok(sub, Some(ctx.request_id)))
}

#[utoipa::path(delete, path = "/webhooks/subscriptions/{id}", responses((status = 200, description = "Subscription deleted")))]
#[axum::debug_handler]
pub async fn handle_delete_subscription(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<SubscriptionId>,
) -> HttpResult<impl IntoResponse> {
    if !state.gateway.webhooks.delete_subscription(&id)? {
        return Err(HttpError::not_found(format!("Subscription not found: {id}")));
    }
    Ok(Envelope::ok(json!({"deleted": true}), Some(ctx.request_id)))
}

/// One synchronous attempt, bypassing the delivery queue and retries.
#[utoipa::path(post, path = "/webhooks/subscriptions/{id}/test", responses((status = 200, description = "Test delivery result")))]
#[axum::debug_handler]
pub async fn handle_test_subscription(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<SubscriptionId>,
) -> HttpResult<Json<Envelope<WebhookDelivery>>> {
    let delivery = state.gateway.webhooks.test_delivery(&id).await?;
    Ok(Envelope::ok(delivery, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/webhooks/deliveries", responses((status = 200, description = "List deliveries")))]
#[axum::debug_handler]
pub async fn handle_list_deliveries(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<ListDeliveriesQuery>,
) -> HttpResult<Json<Envelope<Vec<WebhookDelivery>>>> {
    let deliveries = state.gateway.webhooks.get_deliveries(
        query.subscription_id.as_ref(),
        query.limit.unwrap_or(50).min(500),
        query.offset.unwrap_or(0),
    )?;
    Ok(Envelope::ok(deliveries, Some(ctx.request_id)))
}

#[utoipa::path(get, path = "/webhooks/stats", responses((status = 200, description = "Delivery stats")))]
#[axum::debug_handler]
pub async fn handle_delivery_stats(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
) -> HttpResult<Json<Envelope<DeliveryStats>>> {
    Ok(Envelope::ok(
        state.gateway.webhooks.get_stats()?,
        Some(ctx.request_id),
    ))
}
