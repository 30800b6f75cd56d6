use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use super::{EventSender, Transport, TransportEvent};
use crate::pool::error::TransportError;

/// Child-process transport: line-delimited JSON-RPC over stdin/stdout,
/// stderr drained into logs. Closing kills the child.
pub struct StdioTransport {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connect(format!("spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("child stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        tokio::spawn({
            let events = events.clone();
            async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            if events.send(TransportEvent::Frame(line)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = events
                                .send(TransportEvent::Closed {
                                    reason: "stdout closed".to_string(),
                                })
                                .await;
                            break;
                        }
                        Err(err) => {
                            let _ = events
                                .send(TransportEvent::Closed {
                                    reason: format!("stdout read: {err}"),
                                })
                                .await;
                            break;
                        }
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "upstream_stderr", "{line}");
                }
            });
        }

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            tracing::debug!(?err, "stdio child already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::transport::event_channel;

    #[tokio::test]
    async fn echoes_lines_through_cat() {
        let (tx, mut rx) = event_channel();
        let transport = StdioTransport::spawn("cat", &[], &BTreeMap::new(), tx)
            .await
            .unwrap();

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();

        match rx.recv().await {
            Some(TransportEvent::Frame(frame)) => {
                assert!(frame.contains("\"method\":\"ping\""));
            }
            other => panic!("expected frame, got {other:?}"),
        }

        transport.close().await;
        // the reader observes the child going away
        loop {
            match rx.recv().await {
                Some(TransportEvent::Closed { .. }) | None => break,
                Some(TransportEvent::Frame(_)) => continue,
            }
        }
    }
}
