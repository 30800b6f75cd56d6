use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::error::{TransportError, UpstreamError};
use super::transport::{EventReceiver, Transport, TransportEvent};
use crate::registry::{CatalogPrompt, CatalogResource, CatalogTool, ServerCatalog};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, UpstreamError>>>;

/// JSON-RPC request/response correlation over any transport. Requests
/// get sequential ids; replies are routed to the waiting caller through
/// a pending map. A transport close fails every in-flight call at once.
#[derive(Clone)]
pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    next_id: Arc<AtomicU64>,
    last_activity: Arc<RwLock<DateTime<Utc>>>,
    default_timeout: Duration,
}

impl UpstreamClient {
    /// Wires a client to a transport and starts the reader task. The
    /// `on_close` callback fires once, when the transport reports its
    /// terminal close.
    pub fn start(
        transport: Arc<dyn Transport>,
        mut events: EventReceiver,
        on_close: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        let client = Self {
            transport,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            last_activity: Arc::new(RwLock::new(Utc::now())),
            default_timeout: DEFAULT_CALL_TIMEOUT,
        };

        tokio::spawn({
            let pending = client.pending.clone();
            let last_activity = client.last_activity.clone();
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        TransportEvent::Frame(frame) => {
                            *last_activity.write().unwrap() = Utc::now();
                            route_frame(&pending, &frame);
                        }
                        TransportEvent::Closed { reason } => {
                            fail_all(&pending, &reason);
                            on_close(reason);
                            break;
                        }
                    }
                }
            }
        });

        client
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap()
    }

    /// One JSON-RPC round trip with a deadline. A timeout abandons the
    /// pending slot; a late reply for it is dropped by the router.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        *self.last_activity.write().unwrap() = Utc::now();

        if let Err(err) = self.transport.send(frame).await {
            self.pending.remove(&id);
            return Err(match err {
                TransportError::Closed(reason) => UpstreamError::disconnected(reason),
                other => UpstreamError::failure(other.to_string()),
            });
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::disconnected("connection lost")),
            Err(_) => {
                self.pending.remove(&id);
                Err(UpstreamError::timeout())
            }
        }
    }

    pub async fn initialize(&self) -> Result<Value, UpstreamError> {
        self.request(
            "initialize",
            json!({"clientInfo": {"name": "toolgrid", "version": env!("CARGO_PKG_VERSION")}}),
            None,
        )
        .await
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), UpstreamError> {
        self.request("ping", json!({}), Some(timeout)).await.map(|_| ())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError> {
        self.request(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
            timeout,
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, UpstreamError> {
        self.request("resources/read", json!({"uri": uri}), None).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, UpstreamError> {
        self.request(
            "prompts/get",
            json!({"name": name, "arguments": arguments}),
            None,
        )
        .await
    }

    /// Pulls the upstream's current listings. A method the upstream does
    /// not implement contributes an empty section rather than failing
    /// the whole catalog.
    pub async fn fetch_catalog(&self) -> Result<ServerCatalog, UpstreamError> {
        let mut catalog = ServerCatalog::default();

        match self.request("tools/list", json!({}), None).await {
            Ok(result) => {
                if let Some(tools) = result.get("tools").and_then(Value::as_array) {
                    for tool in tools {
                        let Some(name) = tool.get("name").and_then(Value::as_str) else {
                            continue;
                        };
                        catalog.tools.push(CatalogTool {
                            name: name.to_string(),
                            description: tool
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            schema: tool.get("inputSchema").cloned(),
                        });
                    }
                }
            }
            Err(err) => tracing::debug!(%err, "upstream has no tool listing"),
        }

        match self.request("resources/list", json!({}), None).await {
            Ok(result) => {
                if let Some(resources) = result.get("resources").and_then(Value::as_array) {
                    for resource in resources {
                        let Some(uri) = resource.get("uri").and_then(Value::as_str) else {
                            continue;
                        };
                        catalog.resources.push(CatalogResource {
                            uri: uri.to_string(),
                            name: resource
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or(uri)
                                .to_string(),
                            description: resource
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            mime_type: resource
                                .get("mimeType")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        });
                    }
                }
            }
            Err(err) => tracing::debug!(%err, "upstream has no resource listing"),
        }

        match self.request("prompts/list", json!({}), None).await {
            Ok(result) => {
                if let Some(prompts) = result.get("prompts").and_then(Value::as_array) {
                    for prompt in prompts {
                        let Some(name) = prompt.get("name").and_then(Value::as_str) else {
                            continue;
                        };
                        let arguments = prompt
                            .get("arguments")
                            .and_then(Value::as_array)
                            .map(|args| {
                                args.iter()
                                    .filter_map(|arg| {
                                        Some(toolgrid_types::PromptArgument {
                                            name: arg.get("name")?.as_str()?.to_string(),
                                            description: arg
                                                .get("description")
                                                .and_then(Value::as_str)
                                                .map(str::to_string),
                                            required: arg
                                                .get("required")
                                                .and_then(Value::as_bool)
                                                .unwrap_or(false),
                                        })
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        catalog.prompts.push(CatalogPrompt {
                            name: name.to_string(),
                            description: prompt
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            arguments,
                        });
                    }
                }
            }
            Err(err) => tracing::debug!(%err, "upstream has no prompt listing"),
        }

        Ok(catalog)
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

fn route_frame(pending: &PendingMap, frame: &str) {
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%err, "unparseable frame from upstream");
            return;
        }
    };

    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        // notification; nothing waits on it
        tracing::trace!("upstream notification: {value}");
        return;
    };

    // a reply for an abandoned (timed out) request just drops here
    let Some((_, reply)) = pending.remove(&id) else {
        return;
    };

    let result = if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error");
        Err(UpstreamError::failure(message))
    } else {
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    };

    let _ = reply.send(result);
}

fn fail_all(pending: &PendingMap, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, reply)) = pending.remove(&id) {
            let _ = reply.send(Err(UpstreamError::disconnected(reason)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::transport::event_channel;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Test transport that records outbound frames and lets the test
    /// inject replies.
    struct LoopbackTransport {
        sent: Mutex<Vec<String>>,
        events: crate::pool::transport::EventSender,
        reply_with_result: Value,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn send(&self, frame: String) -> Result<(), TransportError> {
            let value: Value = serde_json::from_str(&frame).unwrap();
            let id = value["id"].as_u64().unwrap();
            self.sent.lock().unwrap().push(frame);
            let _ = self
                .events
                .send(TransportEvent::Frame(
                    json!({"jsonrpc": "2.0", "id": id, "result": self.reply_with_result})
                        .to_string(),
                ))
                .await;
            Ok(())
        }

        async fn close(&self) {
            let _ = self
                .events
                .send(TransportEvent::Closed {
                    reason: "closed".to_string(),
                })
                .await;
        }
    }

    #[tokio::test]
    async fn correlates_request_and_reply() {
        let (tx, rx) = event_channel();
        let transport = Arc::new(LoopbackTransport {
            sent: Mutex::new(Vec::new()),
            events: tx,
            reply_with_result: json!({"temp": 15}),
        });

        let client = UpstreamClient::start(transport.clone(), rx, |_| {});
        let result = client
            .call_tool("current", json!({"city": "Paris"}), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"temp": 15}));

        let sent = transport.sent.lock().unwrap();
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["method"], "tools/call");
        assert_eq!(frame["params"]["arguments"]["city"], "Paris");
    }

    #[tokio::test]
    async fn close_fails_in_flight_calls() {
        struct SilentTransport {
            events: crate::pool::transport::EventSender,
        }

        #[async_trait]
        impl Transport for SilentTransport {
            async fn send(&self, _frame: String) -> Result<(), TransportError> {
                Ok(())
            }
            async fn close(&self) {
                let _ = self
                    .events
                    .send(TransportEvent::Closed {
                        reason: "closed".to_string(),
                    })
                    .await;
            }
        }

        let (tx, rx) = event_channel();
        let transport = Arc::new(SilentTransport { events: tx });
        let closed = Arc::new(Mutex::new(false));
        let closed_clone = closed.clone();

        let client = UpstreamClient::start(transport, rx, move |_| {
            *closed_clone.lock().unwrap() = true;
        });

        let pending_call = {
            let client = client.clone();
            tokio::spawn(async move { client.request("slow", json!({}), None).await })
        };

        // give the request a moment to register, then close underneath it
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let result = pending_call.await.unwrap();
        let err = result.unwrap_err();
        assert_eq!(err.code, toolgrid_types::ErrorCode::ServerDisconnected);
        assert!(*closed.lock().unwrap());
    }
}
