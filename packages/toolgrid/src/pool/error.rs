use thiserror::Error;
use toolgrid_types::{ErrorCode, ServerId};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Server is disabled: {0}")]
    Disabled(ServerId),
    #[error("Transport connect failed for {server_id}: {reason}")]
    Connect { server_id: ServerId, reason: String },
    #[error("Handshake failed for {server_id}: {reason}")]
    Handshake { server_id: ServerId, reason: String },
    #[error("No connection for server: {0}")]
    NotConnected(ServerId),
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("send: {0}")]
    Send(String),
    #[error("closed: {0}")]
    Closed(String),
}

/// Error surfaced by an upstream call through the client.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct UpstreamError {
    pub code: ErrorCode,
    pub message: String,
}

impl UpstreamError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::UpstreamFailure,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            code: ErrorCode::Timeout,
            message: "upstream call timed out".to_string(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ServerDisconnected,
            message: message.into(),
        }
    }
}
