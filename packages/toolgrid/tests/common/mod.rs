use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use axum::{extract::State, routing::post, Router};
use serde_json::{json, Value};

use toolgrid::config::Config;
use toolgrid::gateway::Gateway;
use toolgrid::webhook::WebhookWorker;
use toolgrid_types::{RateLimitConfig, ServerConfig, ServerId, TransportConfig};

/// In-test upstream speaking the JSON-RPC tool protocol over HTTP.
/// `fail_tool_times` makes `tools/call` fail that many times first, for
/// retry and breaker scenarios.
#[derive(Clone)]
pub struct MockUpstream {
    pub calls: Arc<AtomicU32>,
    pub fail_tool_times: Arc<AtomicU32>,
}

impl MockUpstream {
    pub async fn spawn() -> (Self, String) {
        let upstream = Self {
            calls: Arc::new(AtomicU32::new(0)),
            fail_tool_times: Arc::new(AtomicU32::new(0)),
        };

        let app = Router::new()
            .route("/", post(rpc_handler))
            .with_state(upstream.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (upstream, url)
    }

    pub fn tool_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn rpc_handler(State(upstream): State<MockUpstream>, body: String) -> String {
    let request: Value = serde_json::from_str(&body).unwrap();
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or("");

    let result = match method {
        "initialize" => json!({"serverInfo": {"name": "mock", "version": "1.0"}}),
        "ping" => json!({}),
        "tools/list" => json!({"tools": [
            {"name": "current", "description": "current weather", "inputSchema": {"type": "object"}},
            {"name": "forecast", "description": "weekly forecast"},
        ]}),
        "tools/call" => {
            upstream.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = upstream.fail_tool_times.load(Ordering::SeqCst);
            if remaining > 0 {
                upstream.fail_tool_times.fetch_sub(1, Ordering::SeqCst);
                return json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32000, "message": "synthetic upstream failure"},
                })
                .to_string();
            }
            json!({
                "tool": request["params"]["name"],
                "echo": request["params"]["arguments"],
            })
        }
        "prompts/list" => json!({"prompts": [
            {"name": "summary", "description": "summarize data", "arguments": [{"name": "data", "required": true}]},
        ]}),
        "prompts/get" => json!({"messages": [
            {"role": "user", "content": request["params"]["arguments"]},
        ]}),
        "resources/list" => json!({"resources": [
            {"uri": "mock://data", "name": "data", "mimeType": "text/plain"},
        ]}),
        "resources/read" => json!({"contents": [
            {"uri": request["params"]["uri"], "text": "hello from mock"},
        ]}),
        _ => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("method not found: {method}")},
            })
            .to_string();
        }
    };

    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

pub fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        data: data_dir.to_path_buf(),
        master_api_key: Some("test-master-key".to_string()),
        ..Config::default()
    }
}

pub fn build_gateway(data_dir: &std::path::Path) -> (Arc<Gateway>, WebhookWorker, Config) {
    let config = test_config(data_dir);
    // no provider installed in tests, so these are no-op instruments
    let metrics = utils::telemetry::Metrics::init(&opentelemetry::global::meter("toolgrid-tests"));
    let (gateway, worker) = Gateway::new(&config, metrics).unwrap();
    (Arc::new(gateway), worker, config)
}

pub fn upstream_server(name: &str, url: &str, per_minute: u32) -> ServerConfig {
    ServerConfig {
        id: ServerId::generate(),
        name: name.to_string(),
        transport: TransportConfig::Http {
            url: url.to_string(),
            headers: BTreeMap::new(),
        },
        auth: None,
        health_check: Default::default(),
        rate_limits: RateLimitConfig {
            per_minute,
            per_day: 0,
        },
        metadata: Default::default(),
        group_id: None,
        enabled: true,
    }
}
