use thiserror::Error;
use toolgrid_types::ErrorCode;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Step config invalid for {step}: {reason}")]
    BadStepConfig { step: String, reason: String },
    #[error("Duplicate step name: {0}")]
    DuplicateStepName(String),
}

/// Error surfaced by the host when a step's upstream call fails. Carries
/// the stable code so the engine can decide what is retryable.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct HostError {
    pub code: ErrorCode,
    pub message: String,
}

impl HostError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamFailure, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Only upstream failures and timeouts are retried; admission and
    /// validation denials never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, ErrorCode::UpstreamFailure | ErrorCode::Timeout)
    }
}
