use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use toolgrid_types::{
    DeliveryId, DeliveryStatus, SubscriptionId, WebhookDelivery, WebhookSubscription,
};

use crate::events::EventBus;
use crate::storage::webhooks::WebhookStore;
use crate::storage::StorageError;
use utils::context::AppContext;
use utils::telemetry::WebhookMetrics;

const QUEUE_SIZE: usize = 512;
const RESPONSE_BODY_LIMIT: usize = 1000;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Subscription not found: {0}")]
    NotFound(SubscriptionId),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    kind: String,
    payload: serde_json::Value,
    server_id: Option<toolgrid_types::ServerId>,
    timestamp: DateTime<Utc>,
}

/// Reliable HTTP fan-out of bus events to subscribed URLs. Every
/// matching event becomes a persisted delivery row that ends in
/// `success` or `failed` within `retry_count + 1` attempts; nothing is
/// silently lost.
#[derive(Clone)]
pub struct WebhookService {
    store: WebhookStore,
    client: reqwest::Client,
    queue_tx: mpsc::Sender<QueuedEvent>,
    in_flight: Arc<AtomicU64>,
    metrics: WebhookMetrics,
}

impl WebhookService {
    pub fn new(store: WebhookStore, metrics: WebhookMetrics) -> (Self, WebhookWorker) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_SIZE);
        let service = Self {
            store,
            client: reqwest::Client::new(),
            queue_tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            metrics,
        };
        let worker = WebhookWorker {
            service: service.clone(),
            queue_rx,
        };
        (service, worker)
    }

    /// Subscribes to every bus event. The queue is bounded: when it is
    /// full the event is handed to a waiter task that enqueues as soon
    /// as the worker catches up, back-pressuring instead of dropping.
    pub fn attach(&self, bus: &EventBus) {
        let queue_tx = self.queue_tx.clone();
        bus.subscribe(move |event| {
            let queued = QueuedEvent {
                kind: event.kind().to_string(),
                payload: event.payload(),
                server_id: event.server_id().cloned(),
                timestamp: Utc::now(),
            };
            match queue_tx.try_send(queued) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(queued)) => {
                    tracing::warn!(kind = %queued.kind, "webhook queue full, deferring event");
                    let queue_tx = queue_tx.clone();
                    tokio::spawn(async move {
                        if queue_tx.send(queued).await.is_err() {
                            tracing::error!("webhook queue closed while deferring event");
                        }
                    });
                }
                Err(mpsc::error::TrySendError::Closed(queued)) => {
                    tracing::error!(kind = %queued.kind, "webhook worker stopped, event dropped");
                }
            }
        });
    }

    // subscription CRUD

    pub fn create_subscription(&self, sub: &WebhookSubscription) -> Result<(), WebhookError> {
        self.store.insert_subscription(sub)?;
        Ok(())
    }

    pub fn update_subscription(&self, sub: &WebhookSubscription) -> Result<(), WebhookError> {
        self.store.update_subscription(sub)?;
        Ok(())
    }

    pub fn delete_subscription(&self, id: &SubscriptionId) -> Result<bool, WebhookError> {
        Ok(self.store.delete_subscription(id)?)
    }

    pub fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<WebhookSubscription>, WebhookError> {
        Ok(self.store.get_subscription(id)?)
    }

    pub fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>, WebhookError> {
        Ok(self.store.list_subscriptions()?)
    }

    pub fn get_deliveries(
        &self,
        subscription_id: Option<&SubscriptionId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        Ok(self.store.list_deliveries(subscription_id, limit, offset)?)
    }

    pub fn get_stats(&self) -> Result<toolgrid_types::DeliveryStats, WebhookError> {
        Ok(self.store.delivery_stats()?)
    }

    /// Synchronous single attempt bypassing the queue and retry policy.
    #[instrument(level = "debug", skip(self), fields(subsys = "Webhook"))]
    pub async fn test_delivery(
        &self,
        id: &SubscriptionId,
    ) -> Result<WebhookDelivery, WebhookError> {
        let sub = self
            .store
            .get_subscription(id)?
            .ok_or_else(|| WebhookError::NotFound(id.clone()))?;

        let event = QueuedEvent {
            kind: "webhook.test".to_string(),
            payload: serde_json::json!({"test": true}),
            server_id: None,
            timestamp: Utc::now(),
        };

        let mut delivery = new_delivery(&sub, &event);
        self.store.insert_delivery(&delivery)?;

        let outcome = self.attempt(&sub, &event, &delivery.id).await;
        apply_outcome(&mut delivery, 1, outcome);
        if delivery.status == DeliveryStatus::Pending {
            delivery.status = DeliveryStatus::Failed;
        }
        self.metrics
            .increment_total_deliveries(delivery.status.as_str());
        self.store.update_delivery(&delivery)?;
        Ok(delivery)
    }

    /// Waits for in-flight deliveries to land, then drops the queue.
    pub async fn stop(&self, drain_timeout: Duration) {
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "webhook drain timed out"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn matching_subscriptions(&self, event: &QueuedEvent) -> Vec<WebhookSubscription> {
        match self.store.enabled_subscriptions() {
            Ok(subs) => subs
                .into_iter()
                .filter(|sub| sub.events.iter().any(|kind| kind == &event.kind))
                .filter(|sub| {
                    // empty filter = match all servers
                    sub.server_filter.is_empty()
                        || event
                            .server_id
                            .as_ref()
                            .is_some_and(|id| sub.server_filter.contains(id))
                })
                .collect(),
            Err(err) => {
                tracing::error!(?err, "failed to load subscriptions");
                Vec::new()
            }
        }
    }

    /// Full delivery: pending row, then attempts with exponential delay
    /// `retry_delay_ms * 2^attempt` until 2xx or exhaustion.
    #[instrument(level = "debug", skip_all, fields(subsys = "Webhook", url = %sub.url, event = %event.kind))]
    async fn deliver(&self, sub: WebhookSubscription, event: QueuedEvent) {
        let mut delivery = new_delivery(&sub, &event);
        if let Err(err) = self.store.insert_delivery(&delivery) {
            tracing::error!(?err, "failed to persist delivery row");
            self.metrics.increment_total_errors();
            return;
        }

        let max_attempts = sub.retry_count + 1;
        for attempt in 1..=max_attempts {
            let outcome = self.attempt(&sub, &event, &delivery.id).await;
            let success = outcome.success;
            apply_outcome(&mut delivery, attempt, outcome);

            if success || attempt == max_attempts {
                if !success {
                    delivery.status = DeliveryStatus::Failed;
                }
                break;
            }

            let delay = sub.retry_delay_ms.saturating_mul(1 << attempt);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.metrics
            .increment_total_deliveries(delivery.status.as_str());
        if delivery.status == DeliveryStatus::Failed {
            self.metrics.increment_total_errors();
        }

        if let Err(err) = self.store.update_delivery(&delivery) {
            tracing::error!(?err, "failed to update delivery row");
        }
    }

    async fn attempt(
        &self,
        sub: &WebhookSubscription,
        event: &QueuedEvent,
        delivery_id: &DeliveryId,
    ) -> AttemptOutcome {
        let body = serde_json::json!({
            "event": event.kind,
            "timestamp": event.timestamp,
            "data": event.payload,
        })
        .to_string();

        let mut request = self
            .client
            .post(&sub.url)
            .header("Content-Type", "application/json")
            .header("X-Event-Type", &event.kind)
            .header("X-Delivery-Id", delivery_id.as_ref())
            .timeout(Duration::from_millis(sub.timeout_ms))
            .body(body.clone());

        if let Some(secret) = &sub.secret {
            request = request.header("X-Signature", format!("sha256={}", sign(secret, &body)));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let truncated: String = text.chars().take(RESPONSE_BODY_LIMIT).collect();
                AttemptOutcome {
                    success: (200..300).contains(&status),
                    status_code: Some(status),
                    response_body: Some(truncated),
                    error: None,
                }
            }
            Err(err) => AttemptOutcome {
                success: false,
                status_code: None,
                response_body: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Owns the queue receiver; `start` moves it onto the runtime.
pub struct WebhookWorker {
    service: WebhookService,
    queue_rx: mpsc::Receiver<QueuedEvent>,
}

impl WebhookWorker {
    #[instrument(level = "debug", skip_all, fields(subsys = "Webhook"))]
    pub fn start(self, ctx: &AppContext) {
        let WebhookWorker {
            service,
            mut queue_rx,
        } = self;
        let mut kill_receiver = ctx.get_kill_receiver();

        ctx.rt.spawn(async move {
            loop {
                tokio::select! {
                    _ = kill_receiver.recv() => {
                        tracing::debug!("webhook worker shutting down");
                        service.stop(Duration::from_secs(5)).await;
                        break;
                    }
                    event = queue_rx.recv() => {
                        let Some(event) = event else {
                            tracing::debug!("webhook queue closed");
                            break;
                        };
                        for sub in service.matching_subscriptions(&event) {
                            let service = service.clone();
                            let event = event.clone();
                            service.in_flight.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                service.deliver(sub, event).await;
                                service.in_flight.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                    }
                }
            }
        });
    }
}

struct AttemptOutcome {
    success: bool,
    status_code: Option<u16>,
    response_body: Option<String>,
    error: Option<String>,
}

fn new_delivery(sub: &WebhookSubscription, event: &QueuedEvent) -> WebhookDelivery {
    WebhookDelivery {
        id: DeliveryId::generate(),
        subscription_id: sub.id.clone(),
        event: event.kind.clone(),
        payload: event.payload.clone(),
        status: DeliveryStatus::Pending,
        status_code: None,
        response_body: None,
        error: None,
        attempt: 0,
        created_at: Utc::now(),
    }
}

fn apply_outcome(delivery: &mut WebhookDelivery, attempt: u32, outcome: AttemptOutcome) {
    delivery.attempt = attempt;
    delivery.status_code = outcome.status_code;
    delivery.response_body = outcome.response_body;
    delivery.error = outcome.error;
    delivery.status = if outcome.success {
        DeliveryStatus::Success
    } else {
        DeliveryStatus::Pending
    };
}

/// `X-Signature: sha256=<hex hmac>` over the exact body bytes.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    const_hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign("shh", r#"{"event":"server.connected"}"#);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic for the same key and body
        assert_eq!(sig, sign("shh", r#"{"event":"server.connected"}"#));
        // key changes the signature
        assert_ne!(sig, sign("other", r#"{"event":"server.connected"}"#));
    }
}
