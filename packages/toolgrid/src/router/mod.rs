use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use utoipa::ToSchema;

use toolgrid_types::{
    AuditEntry, ErrorCode, GatewayEvent, RequestContext, ServerId, UsageRecord,
};

use crate::admission::breaker::CircuitBreakers;
use crate::admission::rate_limit::{Decision, RateLimiter};
use crate::events::EventBus;
use crate::pool::ConnectionPool;
use crate::registry::Registries;
use crate::storage::audit::AuditStore;
use crate::storage::usage::UsageStore;
use utils::telemetry::RouterMetrics;

/// Result of one routed invocation. Admission denials carry the code and
/// a retry hint; upstream errors are wrapped, never passed through raw.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOutcome {
    pub success: bool,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl InvokeOutcome {
    fn denied(tool_name: &str, code: ErrorCode, error: impl Into<String>, started: chrono::DateTime<Utc>) -> Self {
        Self {
            success: false,
            tool_name: tool_name.to_string(),
            data: None,
            error: Some(error.into()),
            code: Some(code),
            duration_ms: elapsed_ms(started),
            rate_limit: None,
            retry_after_ms: None,
        }
    }
}

/// One item of a batch invocation.
#[derive(Debug, Clone, serde::Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// The single entry point from the API into upstream tool calls:
/// resolve, admit, consume, dispatch, record.
#[derive(Clone)]
pub struct Router {
    registries: Arc<Registries>,
    breakers: Arc<CircuitBreakers>,
    limiter: Arc<RateLimiter>,
    pool: ConnectionPool,
    events: Arc<EventBus>,
    audit: AuditStore,
    usage: UsageStore,
    metrics: RouterMetrics,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registries: Arc<Registries>,
        breakers: Arc<CircuitBreakers>,
        limiter: Arc<RateLimiter>,
        pool: ConnectionPool,
        events: Arc<EventBus>,
        audit: AuditStore,
        usage: UsageStore,
        metrics: RouterMetrics,
    ) -> Self {
        Self {
            registries,
            breakers,
            limiter,
            pool,
            events,
            audit,
            usage,
            metrics,
        }
    }

    #[instrument(level = "debug", skip(self, ctx, params), fields(subsys = "Router", request = %ctx.request_id))]
    pub async fn invoke(&self, ctx: &RequestContext, name: &str, params: Value) -> InvokeOutcome {
        let started = Utc::now();

        let Some(entry) = self.registries.tools.find(name) else {
            self.metrics.increment_total_invocations("denied");
            return InvokeOutcome::denied(name, ErrorCode::NotFound, "Tool not found", started);
        };

        self.dispatch(ctx, &entry.server_id, name, &entry.name, params, started)
            .await
    }

    /// Skips the registry: the caller already knows which upstream and
    /// which local tool name.
    #[instrument(level = "debug", skip(self, ctx, params), fields(subsys = "Router", request = %ctx.request_id))]
    pub async fn invoke_on_server(
        &self,
        ctx: &RequestContext,
        server_id: &ServerId,
        local_name: &str,
        params: Value,
    ) -> InvokeOutcome {
        let started = Utc::now();
        self.dispatch(ctx, server_id, local_name, local_name, params, started)
            .await
    }

    /// Runs items concurrently; results come back in input order and one
    /// failing item never cancels the others.
    pub async fn invoke_batch(
        &self,
        ctx: &RequestContext,
        items: Vec<BatchItem>,
    ) -> Vec<InvokeOutcome> {
        let futures = items.into_iter().map(|item| {
            let BatchItem { name, params } = item;
            async move { self.invoke(ctx, &name, params).await }
        });
        join_all(futures).await
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        server_id: &ServerId,
        qualified_name: &str,
        local_name: &str,
        params: Value,
        started: chrono::DateTime<Utc>,
    ) -> InvokeOutcome {
        if !self.breakers.admit(server_id) {
            self.metrics.increment_total_invocations("denied");
            let mut outcome = InvokeOutcome::denied(
                qualified_name,
                ErrorCode::CircuitOpen,
                "Circuit open",
                started,
            );
            outcome.retry_after_ms = self.breakers.retry_after_ms(server_id);
            return outcome;
        }

        let decision = self.limiter.consume(server_id);
        if !decision.allowed {
            self.metrics.increment_total_invocations("denied");
            let mut outcome = InvokeOutcome::denied(
                qualified_name,
                ErrorCode::RateLimited,
                "Rate limit exceeded",
                started,
            );
            outcome.retry_after_ms = decision.retry_after_ms;
            outcome.rate_limit = Some(decision);
            return outcome;
        }

        let Some(client) = self.pool.client(server_id) else {
            self.metrics.increment_total_invocations("denied");
            let mut outcome = InvokeOutcome::denied(
                qualified_name,
                ErrorCode::ServerDisconnected,
                "Server not connected",
                started,
            );
            outcome.rate_limit = Some(decision);
            return outcome;
        };

        let timeout = ctx.time_remaining().filter(|d| *d > Duration::ZERO);
        let result = client.call_tool(local_name, params, timeout).await;
        let duration_ms = elapsed_ms(started);

        match result {
            Ok(data) => {
                self.metrics.increment_total_invocations("success");
                self.breakers.record_success(server_id);
                self.registries.tools.record_usage(qualified_name);
                self.record_usage(ctx, server_id, qualified_name, duration_ms);
                self.record_audit(ctx, qualified_name, true, None, duration_ms);
                self.events.publish(GatewayEvent::ToolInvoked {
                    server_id: server_id.clone(),
                    tool_name: qualified_name.to_string(),
                    duration_ms,
                });

                InvokeOutcome {
                    success: true,
                    tool_name: qualified_name.to_string(),
                    data: Some(data),
                    error: None,
                    code: None,
                    duration_ms,
                    rate_limit: Some(decision),
                    retry_after_ms: None,
                }
            }
            Err(err) => {
                self.metrics.increment_total_invocations("error");
                self.metrics.increment_total_errors();
                self.breakers.record_failure(server_id);
                self.record_audit(ctx, qualified_name, false, Some(&err.message), duration_ms);
                self.events.publish(GatewayEvent::ToolFailed {
                    server_id: server_id.clone(),
                    tool_name: qualified_name.to_string(),
                    error: err.message.clone(),
                    duration_ms,
                });

                InvokeOutcome {
                    success: false,
                    tool_name: qualified_name.to_string(),
                    data: None,
                    error: Some(format!("Upstream call failed: {}", err.message)),
                    code: Some(err.code),
                    duration_ms,
                    rate_limit: Some(decision),
                    retry_after_ms: None,
                }
            }
        }
    }

    fn record_usage(
        &self,
        ctx: &RequestContext,
        server_id: &ServerId,
        tool_name: &str,
        duration_ms: u64,
    ) {
        let Some(api_key_id) = ctx.principal.api_key_id.clone().or_else(|| {
            // master-key calls are attributed to a reserved id
            toolgrid_types::ApiKeyId::new("master").ok()
        }) else {
            return;
        };

        let record = UsageRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            api_key_id,
            tenant_id: ctx.principal.tenant_id.clone(),
            server_id: Some(server_id.clone()),
            tool_name: Some(tool_name.to_string()),
            action_type: "tool_call".to_string(),
            count: 1,
            tokens_used: None,
            cost_credits: None,
            duration_ms: Some(duration_ms),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.usage.append(&record) {
            tracing::warn!(?err, "failed to record usage");
        }
    }

    fn record_audit(
        &self,
        ctx: &RequestContext,
        tool_name: &str,
        success: bool,
        error: Option<&str>,
        duration_ms: u64,
    ) {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            action: "tool.invoke".to_string(),
            resource_type: "tool".to_string(),
            resource_id: Some(tool_name.to_string()),
            api_key_id: ctx.principal.api_key_id.clone(),
            tenant_id: ctx.principal.tenant_id.clone(),
            ip_address: None,
            user_agent: None,
            duration_ms: Some(duration_ms),
            success,
            details: match error {
                Some(error) => serde_json::json!({"requestId": ctx.request_id, "error": error}),
                None => serde_json::json!({"requestId": ctx.request_id}),
            },
        };
        if let Err(err) = self.audit.append(&entry) {
            tracing::warn!(?err, "failed to record audit entry");
        }
    }
}

fn elapsed_ms(started: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - started).num_milliseconds().max(0) as u64
}
