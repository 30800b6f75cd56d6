use async_trait::async_trait;

use toolgrid_engine::{HostError, SamplingRequest, SamplingResponse};
use toolgrid_types::ErrorCode;

/// The LLM collaborator behind `sampling` steps. The kernel only routes;
/// providers live behind this trait.
#[async_trait]
pub trait SamplingProvider: Send + Sync {
    async fn sample(&self, request: SamplingRequest) -> Result<SamplingResponse, HostError>;
}

/// Default provider when no sampling backend is configured: every
/// sampling step fails with a clear validation error.
pub struct DisabledSampler;

#[async_trait]
impl SamplingProvider for DisabledSampler {
    async fn sample(&self, _request: SamplingRequest) -> Result<SamplingResponse, HostError> {
        Err(HostError::new(
            ErrorCode::Validation,
            "no sampling provider is configured",
        ))
    }
}
