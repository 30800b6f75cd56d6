use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{EventSender, Transport, TransportEvent};
use crate::pool::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Stateless request-per-frame transport: every outbound frame becomes a
/// POST, the response body comes back as an inbound frame. Correlation
/// still rides on the JSON-RPC id inside the body.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    events: EventSender,
}

impl HttpTransport {
    pub fn new(url: String, headers: BTreeMap<String, String>, events: EventSender) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            headers,
            events,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .body(frame);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Send(format!(
                "upstream returned status {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        if !body.trim().is_empty() {
            let _ = self.events.send(TransportEvent::Frame(body)).await;
        }
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
