pub mod client;
pub mod error;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use dashmap::DashMap;
use tracing::instrument;

use toolgrid_types::{
    ConnectionState, ConnectionStatus, GatewayEvent, ServerAuth, ServerConfig, ServerId,
    TransportConfig,
};

use crate::admission::breaker::CircuitBreakers;
use crate::events::EventBus;
use client::UpstreamClient;
use error::PoolError;
use transport::{event_channel, ws::WsOptions, ws::WsTransport, Transport};
use utils::telemetry::PoolMetrics;

struct ConnectionEntry {
    server_name: String,
    state: ConnectionState,
    client: Option<UpstreamClient>,
    reconnect_attempts: u32,
    /// Set before a planned close so the transport's close event is not
    /// reported as a server error.
    closing: Arc<AtomicBool>,
}

/// Exclusive owner of upstream connections, at most one per server id.
/// Other components see only cloned [`UpstreamClient`] handles, valid
/// for the duration of a single call. Reconnection is the transport's
/// business; the pool never retries application calls.
#[derive(Clone)]
pub struct ConnectionPool {
    connections: Arc<DashMap<ServerId, ConnectionEntry>>,
    events: Arc<EventBus>,
    breakers: Arc<CircuitBreakers>,
    metrics: PoolMetrics,
}

impl ConnectionPool {
    pub fn new(
        events: Arc<EventBus>,
        breakers: Arc<CircuitBreakers>,
        metrics: PoolMetrics,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            events,
            breakers,
            metrics,
        }
    }

    /// Idempotent: connecting a connected (or connecting) server returns
    /// its current status without touching the transport.
    #[instrument(level = "debug", skip_all, fields(subsys = "Pool", server = %cfg.id))]
    pub async fn connect(&self, cfg: &ServerConfig) -> Result<ConnectionStatus, PoolError> {
        if !cfg.enabled {
            return Err(PoolError::Disabled(cfg.id.clone()));
        }

        // claim or refuse the slot atomically so two concurrent connects
        // cannot both build transports
        {
            let mut entry = self
                .connections
                .entry(cfg.id.clone())
                .or_insert_with(|| ConnectionEntry {
                    server_name: cfg.name.clone(),
                    state: ConnectionState::Disconnected,
                    client: None,
                    reconnect_attempts: 0,
                    closing: Arc::new(AtomicBool::new(false)),
                });
            if matches!(
                entry.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(self.entry_status(&cfg.id, &entry));
            }
            entry.state = ConnectionState::Connecting;
            entry.server_name = cfg.name.clone();
            entry.client = None;
            entry.closing = Arc::new(AtomicBool::new(false));
        }

        let (events_tx, events_rx) = event_channel();
        let transport: Arc<dyn Transport> = match self.build_transport(cfg, events_tx).await {
            Ok(transport) => transport,
            Err(reason) => {
                self.mark_failed(&cfg.id, &reason);
                return Err(PoolError::Connect {
                    server_id: cfg.id.clone(),
                    reason,
                });
            }
        };

        let closing = self
            .connections
            .get(&cfg.id)
            .map(|entry| entry.closing.clone())
            .unwrap_or_default();

        let client = UpstreamClient::start(transport, events_rx, {
            let pool = self.clone();
            let server_id = cfg.id.clone();
            let closing = closing.clone();
            move |reason| {
                if closing.load(Ordering::SeqCst) {
                    return;
                }
                pool.on_unplanned_close(&server_id, &reason);
            }
        });

        if let Err(err) = client.initialize().await {
            // planned teardown; the close event is not a second failure
            closing.store(true, Ordering::SeqCst);
            client.close().await;
            let reason = err.to_string();
            self.mark_failed(&cfg.id, &reason);
            return Err(PoolError::Handshake {
                server_id: cfg.id.clone(),
                reason,
            });
        }

        if let Some(mut entry) = self.connections.get_mut(&cfg.id) {
            entry.state = ConnectionState::Connected;
            entry.client = Some(client);
        }
        self.record_active_gauge();

        self.events.publish(GatewayEvent::ServerConnected {
            server_id: cfg.id.clone(),
            server_name: cfg.name.clone(),
        });

        Ok(self
            .status(&cfg.id)
            .expect("entry inserted above cannot be missing"))
    }

    /// Idempotent; disconnecting an unknown server is a no-op.
    #[instrument(level = "debug", skip(self), fields(subsys = "Pool"))]
    pub async fn disconnect(&self, server_id: &ServerId) {
        let (client, server_name) = {
            let Some(mut entry) = self.connections.get_mut(server_id) else {
                return;
            };
            if entry.state == ConnectionState::Disconnected {
                return;
            }
            entry.closing.store(true, Ordering::SeqCst);
            entry.state = ConnectionState::Disconnected;
            (entry.client.take(), entry.server_name.clone())
        };

        if let Some(client) = client {
            client.close().await;
        }
        self.record_active_gauge();

        self.events.publish(GatewayEvent::ServerDisconnected {
            server_id: server_id.clone(),
            server_name,
        });
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<ServerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Drops all record of a server; used when the server is deleted.
    pub async fn remove(&self, server_id: &ServerId) {
        self.disconnect(server_id).await;
        self.connections.remove(server_id);
    }

    /// A callable handle, present only while connected.
    pub fn client(&self, server_id: &ServerId) -> Option<UpstreamClient> {
        let entry = self.connections.get(server_id)?;
        if entry.state == ConnectionState::Connected {
            entry.client.clone()
        } else {
            None
        }
    }

    pub fn status(&self, server_id: &ServerId) -> Option<ConnectionStatus> {
        self.connections
            .get(server_id)
            .map(|entry| self.entry_status(server_id, &entry))
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|entry| self.entry_status(entry.key(), &entry))
            .collect()
    }

    fn entry_status(&self, server_id: &ServerId, entry: &ConnectionEntry) -> ConnectionStatus {
        ConnectionStatus {
            server_id: server_id.clone(),
            state: entry.state,
            reconnect_attempts: entry.reconnect_attempts,
            last_activity: entry.client.as_ref().map(|c| c.last_activity()),
        }
    }

    async fn build_transport(
        &self,
        cfg: &ServerConfig,
        events_tx: transport::EventSender,
    ) -> Result<Arc<dyn Transport>, String> {
        match &cfg.transport {
            TransportConfig::Stdio { command, args, env } => {
                transport::stdio::StdioTransport::spawn(command, args, env, events_tx)
                    .await
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
                    .map_err(|e| e.to_string())
            }
            TransportConfig::Http { url, headers } => {
                Ok(Arc::new(transport::http::HttpTransport::new(
                    url.clone(),
                    with_auth_headers(headers, cfg.auth.as_ref()),
                    events_tx,
                )))
            }
            TransportConfig::Ws { url, headers } => {
                let options = WsOptions::new(
                    url.clone(),
                    with_auth_headers(headers, cfg.auth.as_ref()),
                );
                WsTransport::connect(options, events_tx)
                    .await
                    .map(|t| Arc::new(t) as Arc<dyn Transport>)
                    .map_err(|e| e.to_string())
            }
        }
    }

    fn mark_failed(&self, server_id: &ServerId, reason: &str) {
        if let Some(mut entry) = self.connections.get_mut(server_id) {
            entry.state = ConnectionState::Failed;
            entry.client = None;
        }
        self.record_active_gauge();
        self.metrics.increment_total_errors();
        self.breakers.record_failure(server_id);
        self.events.publish(GatewayEvent::ServerError {
            server_id: server_id.clone(),
            error: reason.to_string(),
        });
    }

    fn record_active_gauge(&self) {
        let connected = self
            .connections
            .iter()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .count() as u64;
        self.metrics.record_active_connections(connected);
    }

    /// Transport died underneath us (reconnect exhausted, peer gone).
    fn on_unplanned_close(&self, server_id: &ServerId, reason: &str) {
        tracing::warn!(server = %server_id, reason, "connection lost");
        self.mark_failed(server_id, reason);
    }
}

fn with_auth_headers(
    headers: &BTreeMap<String, String>,
    auth: Option<&ServerAuth>,
) -> BTreeMap<String, String> {
    let mut merged = headers.clone();
    match auth {
        Some(ServerAuth::Bearer { token }) => {
            merged.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        Some(ServerAuth::Header { name, value }) => {
            merged.insert(name.clone(), value.clone());
        }
        None => {}
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::breaker::BreakerConfig;
    use std::sync::Mutex;

    fn pool_with_bus() -> (ConnectionPool, Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.kind().to_string());
        });
        let breakers = Arc::new(CircuitBreakers::new(BreakerConfig::default(), bus.clone()));
        let metrics = PoolMetrics::init(&opentelemetry::global::meter("toolgrid-tests"));
        (ConnectionPool::new(bus.clone(), breakers, metrics), bus, seen)
    }

    fn stdio_server(command: &str) -> ServerConfig {
        ServerConfig {
            id: ServerId::generate(),
            name: "echo".to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
            },
            auth: None,
            health_check: Default::default(),
            rate_limits: Default::default(),
            metadata: Default::default(),
            group_id: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn connect_failure_emits_server_error() {
        let (pool, _bus, seen) = pool_with_bus();
        let cfg = stdio_server("definitely-not-a-real-binary-xyz");

        let result = pool.connect(&cfg).await;
        assert!(matches!(result, Err(PoolError::Connect { .. })));
        assert_eq!(
            pool.status(&cfg.id).unwrap().state,
            ConnectionState::Failed
        );
        assert!(seen.lock().unwrap().contains(&"server.error".to_string()));
        assert!(pool.client(&cfg.id).is_none());
    }

    #[tokio::test]
    async fn disabled_server_is_rejected() {
        let (pool, _bus, _seen) = pool_with_bus();
        let mut cfg = stdio_server("cat");
        cfg.enabled = false;

        assert!(matches!(
            pool.connect(&cfg).await,
            Err(PoolError::Disabled(_))
        ));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (pool, _bus, seen) = pool_with_bus();
        let cfg = stdio_server("cat");

        // cat echoes frames back verbatim, so the JSON-RPC handshake
        // correlates and the connection comes up
        let first = pool.connect(&cfg).await.unwrap();
        assert_eq!(first.state, ConnectionState::Connected);
        let second = pool.connect(&cfg).await.unwrap();
        assert_eq!(second.state, ConnectionState::Connected);

        let connected_events = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|k| *k == "server.connected")
            .count();
        assert_eq!(connected_events, 1);
        assert!(pool.client(&cfg.id).is_some());

        pool.disconnect(&cfg.id).await;
        assert!(pool.client(&cfg.id).is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (pool, _bus, seen) = pool_with_bus();
        let cfg = stdio_server("cat");

        // cat echoes the initialize frame back verbatim, which correlates
        // as a (null) reply, so the handshake passes
        let _ = pool.connect(&cfg).await;
        pool.disconnect(&cfg.id).await;
        pool.disconnect(&cfg.id).await;

        let disconnects = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|k| *k == "server.disconnected")
            .count();
        assert!(disconnects <= 1);
    }
}
