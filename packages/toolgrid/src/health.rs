use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use utoipa::ToSchema;

use toolgrid_types::{ConnectionState, ServerId};

use crate::pool::ConnectionPool;
use crate::storage::servers::ServerStore;
use utils::context::AppContext;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub servers: HashMap<ServerId, ServerHealthResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealthResult {
    Healthy,
    Unhealthy { error: String },
    Unknown,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            servers: HashMap::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.servers
            .values()
            .all(|result| matches!(result, ServerHealthResult::Healthy))
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedHealthStatus = Arc<RwLock<HealthStatus>>;

pub fn create_shared_health_status() -> SharedHealthStatus {
    Arc::new(RwLock::new(HealthStatus::new()))
}

/// How often the checker wakes up; each server is actually probed on its
/// own configured interval.
const TICK: Duration = Duration::from_secs(5);

/// Periodic upstream liveness probe. Pings connected servers on their
/// configured cadence, publishes results into the shared status map, and
/// feeds the breaker so a dead-but-connected upstream opens its circuit
/// without waiting for caller traffic.
pub struct HealthChecker {
    pool: ConnectionPool,
    servers: ServerStore,
    breakers: Arc<crate::admission::breaker::CircuitBreakers>,
    status: SharedHealthStatus,
}

impl HealthChecker {
    pub fn new(
        pool: ConnectionPool,
        servers: ServerStore,
        breakers: Arc<crate::admission::breaker::CircuitBreakers>,
        status: SharedHealthStatus,
    ) -> Self {
        Self {
            pool,
            servers,
            breakers,
            status,
        }
    }

    pub fn start(self, ctx: &AppContext) {
        let mut kill_receiver = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let mut last_checked: HashMap<ServerId, tokio::time::Instant> = HashMap::new();
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = kill_receiver.recv() => {
                        tracing::debug!("health checker shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.sweep(&mut last_checked).await;
                    }
                }
            }
        });
    }

    async fn sweep(&self, last_checked: &mut HashMap<ServerId, tokio::time::Instant>) {
        let servers = match self.servers.list() {
            Ok(servers) => servers,
            Err(err) => {
                tracing::warn!(?err, "health sweep could not list servers");
                return;
            }
        };

        let now = tokio::time::Instant::now();
        let mut results: Vec<(ServerId, ServerHealthResult)> = Vec::new();

        for server in servers {
            if !server.enabled || !server.health_check.enabled {
                continue;
            }

            let due = last_checked
                .get(&server.id)
                .map(|at| now.duration_since(*at).as_millis() as u64 >= server.health_check.interval_ms)
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_checked.insert(server.id.clone(), now);

            let result = match self.pool.status(&server.id).map(|s| s.state) {
                Some(ConnectionState::Connected) => {
                    let Some(client) = self.pool.client(&server.id) else {
                        results.push((server.id.clone(), ServerHealthResult::Unknown));
                        continue;
                    };
                    let timeout = Duration::from_millis(server.health_check.timeout_ms);
                    match client.ping(timeout).await {
                        Ok(()) => {
                            self.breakers.record_success(&server.id);
                            ServerHealthResult::Healthy
                        }
                        Err(err) => {
                            self.breakers.record_failure(&server.id);
                            ServerHealthResult::Unhealthy {
                                error: err.to_string(),
                            }
                        }
                    }
                }
                _ => ServerHealthResult::Unknown,
            };
            results.push((server.id, result));
        }

        if !results.is_empty() {
            let mut status = self.status.write().unwrap();
            status.timestamp = Utc::now();
            for (server_id, result) in results {
                status.servers.insert(server_id, result);
            }
        }
    }
}
