use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

use super::{EventSender, Transport, TransportEvent};
use crate::pool::error::TransportError;

/// Close codes on the upstream wire: 1000 normal, 4000 heartbeat
/// timeout, 4001 forced reconnect.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
const CLOSE_FORCE_RECONNECT: u16 = 4001;

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub initial_reconnect_delay: Duration,
    pub reconnect_multiplier: f64,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Sends queued while reconnecting; overflow is rejected, not dropped
    /// silently.
    pub pending_buffer: usize,
}

impl WsOptions {
    pub fn new(url: String, headers: BTreeMap<String, String>) -> Self {
        Self {
            url,
            headers,
            initial_reconnect_delay: Duration::from_secs(1),
            reconnect_multiplier: 2.0,
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            pending_buffer: 64,
        }
    }
}

enum Command {
    Send(String, oneshot::Sender<Result<(), TransportError>>),
    ForceReconnect,
    Close,
}

/// WebSocket transport with reconnection. A single manager task owns the
/// socket; sends travel over a command channel so callers never touch
/// the sink directly. On unplanned close, reconnects with exponential
/// backoff while buffering pending sends; a heartbeat probe rides every
/// `heartbeat_interval` and a missing pong within `heartbeat_timeout`
/// force-closes the socket to trigger the same reconnect path.
pub struct WsTransport {
    commands: mpsc::Sender<Command>,
}

impl WsTransport {
    pub async fn connect(options: WsOptions, events: EventSender) -> Result<Self, TransportError> {
        // fail fast on the first connect so the pool can report it
        let socket = open_socket(&options).await?;

        let (commands, command_rx) = mpsc::channel(64);
        tokio::spawn(manager_loop(options, socket, command_rx, events));

        Ok(Self { commands })
    }

    /// Closes with code 4001 so the manager reconnects with a fresh
    /// socket; used by health checking when a connection looks wedged.
    pub async fn force_reconnect(&self) {
        let _ = self.commands.send(Command::ForceReconnect).await;
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(frame, reply_tx))
            .await
            .map_err(|_| TransportError::Closed("transport task gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| TransportError::Closed("transport task gone".to_string()))?
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn open_socket(options: &WsOptions) -> Result<Socket, TransportError> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    for (name, value) in &options.headers {
        let name: tokio_tungstenite::tungstenite::http::HeaderName = name
            .parse()
            .map_err(|_| TransportError::Connect(format!("bad header name: {name}")))?;
        let value = value
            .parse()
            .map_err(|_| TransportError::Connect(format!("bad header value for {name}")))?;
        request.headers_mut().insert(name, value);
    }

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(socket)
}

/// `"pong"` or `{"type":"pong"}` both count as heartbeat responses.
fn is_pong_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed == "pong" {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "pong"))
        .unwrap_or(false)
}

enum SessionEnd {
    /// Planned shutdown; manager exits.
    Shutdown,
    /// Unplanned close or error; manager reconnects.
    Lost(String),
}

async fn manager_loop(
    options: WsOptions,
    socket: Socket,
    mut commands: mpsc::Receiver<Command>,
    events: EventSender,
) {
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut socket = Some(socket);
    let mut attempts: u32 = 0;

    loop {
        let active = match socket.take() {
            Some(active) => active,
            None => {
                // reconnect path with exponential backoff
                attempts += 1;
                if attempts > options.max_reconnect_attempts {
                    let _ = events
                        .send(TransportEvent::Closed {
                            reason: format!(
                                "gave up after {} reconnect attempts",
                                options.max_reconnect_attempts
                            ),
                        })
                        .await;
                    fail_remaining(&mut commands, &mut pending).await;
                    return;
                }

                let delay = reconnect_delay(&options, attempts);
                tracing::info!(url = %options.url, attempt = attempts, ?delay, "ws reconnecting");

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = commands.recv() => match cmd {
                            Some(Command::Send(frame, reply)) => {
                                if pending.len() >= options.pending_buffer {
                                    let _ = reply.send(Err(TransportError::Send(
                                        "pending buffer full while reconnecting".to_string(),
                                    )));
                                } else {
                                    pending.push_back(frame);
                                    let _ = reply.send(Ok(()));
                                }
                            }
                            Some(Command::ForceReconnect) => {}
                            Some(Command::Close) | None => {
                                let _ = events
                                    .send(TransportEvent::Closed { reason: "closed".to_string() })
                                    .await;
                                return;
                            }
                        }
                    }
                }

                match open_socket(&options).await {
                    Ok(fresh) => {
                        attempts = 0;
                        fresh
                    }
                    Err(err) => {
                        tracing::warn!(url = %options.url, %err, "ws reconnect failed");
                        continue;
                    }
                }
            }
        };

        match run_session(&options, active, &mut commands, &events, &mut pending).await {
            SessionEnd::Shutdown => {
                let _ = events
                    .send(TransportEvent::Closed {
                        reason: "closed".to_string(),
                    })
                    .await;
                return;
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!(url = %options.url, reason, "ws connection lost");
                // socket stays None; next loop iteration reconnects
            }
        }
    }
}

async fn run_session(
    options: &WsOptions,
    mut socket: Socket,
    commands: &mut mpsc::Receiver<Command>,
    events: &EventSender,
    pending: &mut VecDeque<String>,
) -> SessionEnd {
    // drain sends queued while we were away
    while let Some(frame) = pending.pop_front() {
        if let Err(err) = socket.send(Message::Text(frame.into())).await {
            return SessionEnd::Lost(format!("drain: {err}"));
        }
    }

    let mut heartbeat = tokio::time::interval(options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    // armed after each ping; a pong (either form) disarms it
    let mut awaiting_pong = false;
    let pong_deadline = tokio::time::sleep(options.heartbeat_timeout);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Send(frame, reply)) => {
                    let result = socket
                        .send(Message::Text(frame.into()))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()));
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        return SessionEnd::Lost("send failed".to_string());
                    }
                }
                Some(Command::ForceReconnect) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(CLOSE_FORCE_RECONNECT),
                            reason: "forced reconnect".into(),
                        })))
                        .await;
                    return SessionEnd::Lost("forced reconnect".to_string());
                }
                Some(Command::Close) | None => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(CLOSE_NORMAL),
                            reason: "shutdown".into(),
                        })))
                        .await;
                    return SessionEnd::Shutdown;
                }
            },

            msg = socket.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let text = text.to_string();
                    if is_pong_text(&text) {
                        awaiting_pong = false;
                    } else if events.send(TransportEvent::Frame(text)).await.is_err() {
                        return SessionEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                }
                // tungstenite answers pings automatically
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Lost(format!("closed by peer: {frame:?}"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    return SessionEnd::Lost(err.to_string());
                }
                None => {
                    return SessionEnd::Lost("stream ended".to_string());
                }
            },

            _ = heartbeat.tick() => {
                if !awaiting_pong {
                    if let Err(err) = socket.send(Message::Text("ping".into())).await {
                        return SessionEnd::Lost(format!("heartbeat send: {err}"));
                    }
                    awaiting_pong = true;
                    pong_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + options.heartbeat_timeout);
                }
            }

            _ = &mut pong_deadline, if awaiting_pong => {
                // no pong in time: force-close to trigger reconnect
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLOSE_HEARTBEAT_TIMEOUT),
                        reason: "heartbeat timeout".into(),
                    })))
                    .await;
                return SessionEnd::Lost("heartbeat timeout".to_string());
            }
        }
    }
}

fn reconnect_delay(options: &WsOptions, attempt: u32) -> Duration {
    let factor = options.reconnect_multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay = options.initial_reconnect_delay.mul_f64(factor);
    delay.min(options.max_reconnect_delay)
}

async fn fail_remaining(commands: &mut mpsc::Receiver<Command>, pending: &mut VecDeque<String>) {
    pending.clear();
    while let Ok(cmd) = commands.try_recv() {
        if let Command::Send(_, reply) = cmd {
            let _ = reply.send(Err(TransportError::Closed(
                "transport gave up reconnecting".to_string(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_texts_are_recognized() {
        assert!(is_pong_text("pong"));
        assert!(is_pong_text("  pong  "));
        assert!(is_pong_text(r#"{"type":"pong"}"#));
        assert!(!is_pong_text(r#"{"type":"ping"}"#));
        assert!(!is_pong_text(r#"{"jsonrpc":"2.0","id":1}"#));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let options = WsOptions::new("ws://localhost:1".to_string(), BTreeMap::new());
        assert_eq!(reconnect_delay(&options, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&options, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(&options, 3), Duration::from_secs(4));
        // capped
        assert_eq!(reconnect_delay(&options, 10), Duration::from_secs(30));
    }
}
