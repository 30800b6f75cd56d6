pub mod http;
pub mod stdio;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::TransportError;

pub const EVENT_CHANNEL_SIZE: usize = 256;

/// What a transport reports upward: inbound frames and the terminal
/// close. After `Closed` no further events arrive.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(String),
    Closed { reason: String },
}

/// Minimal contract every transport satisfies. Frames are opaque
/// strings; the request/response correlation lives in the client above.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;
    async fn close(&self);
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_SIZE)
}
