use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::{GroupId, ServerId};

/// Definition of an upstream tool server as stored and served over the API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: ServerId,
    /// Unique human-facing name; the first half of every qualified name.
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ServerAuth>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub metadata: ServerMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// How the gateway reaches the upstream. Tagged so configs read naturally
/// in both JSON and TOML.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Ws {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Http { .. } => "http",
            TransportConfig::Ws { .. } => "ws",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerAuth {
    Bearer { token: String },
    Header { name: String, value: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
        }
    }
}

/// Per-server admission caps. A value of 0 means "no cap for that window".
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default)]
    pub per_minute: u32,
    #[serde(default)]
    pub per_day: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Runtime connection state of a single upstream. There is at most one
/// connection per server id, owned exclusively by the pool.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub server_id: ServerId,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroup {
    pub id: GroupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_tagging() {
        let t: TransportConfig = serde_json::from_str(
            r#"{"type":"stdio","command":"weather-server","args":["--fast"]}"#,
        )
        .unwrap();
        assert_eq!(t.kind(), "stdio");

        let t: TransportConfig =
            serde_json::from_str(r#"{"type":"ws","url":"ws://localhost:9001"}"#).unwrap();
        assert_eq!(t.kind(), "ws");
    }

    #[test]
    fn rate_limit_defaults_to_uncapped() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{
                "id": "srv-weather",
                "name": "weather",
                "transport": {"type": "http", "url": "http://localhost:4000"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.rate_limits.per_minute, 0);
        assert_eq!(cfg.rate_limits.per_day, 0);
        assert!(cfg.enabled);
        assert!(cfg.health_check.enabled);
    }
}
