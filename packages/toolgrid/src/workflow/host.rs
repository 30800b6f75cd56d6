use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use toolgrid_engine::{HostError, SamplingRequest, SamplingResponse, StepHost};
use toolgrid_types::{split_qualified_name, ErrorCode, RequestContext};

use super::sampling::SamplingProvider;
use crate::pool::ConnectionPool;
use crate::registry::Registries;
use crate::router::Router;

/// Bridges engine steps onto the gateway runtime: tool steps go through
/// the router (admission included), prompt/resource steps straight to
/// the owning upstream, sampling to the configured provider.
pub struct GatewayStepHost {
    router: Router,
    registries: Arc<Registries>,
    pool: ConnectionPool,
    sampler: Arc<dyn SamplingProvider>,
}

impl GatewayStepHost {
    pub fn new(
        router: Router,
        registries: Arc<Registries>,
        pool: ConnectionPool,
        sampler: Arc<dyn SamplingProvider>,
    ) -> Self {
        Self {
            router,
            registries,
            pool,
            sampler,
        }
    }
}

#[async_trait]
impl StepHost for GatewayStepHost {
    async fn call_tool(&self, qualified_name: &str, params: Value) -> Result<Value, HostError> {
        let ctx = RequestContext::system();
        let outcome = self.router.invoke(&ctx, qualified_name, params).await;

        if outcome.success {
            Ok(outcome.data.unwrap_or(Value::Null))
        } else {
            Err(HostError::new(
                outcome.code.unwrap_or(ErrorCode::UpstreamFailure),
                outcome
                    .error
                    .unwrap_or_else(|| "tool call failed".to_string()),
            ))
        }
    }

    async fn get_prompt(&self, qualified_name: &str, arguments: Value) -> Result<Value, HostError> {
        let entry = self
            .registries
            .prompts
            .find(qualified_name)
            .ok_or_else(|| HostError::not_found(format!("Prompt not found: {qualified_name}")))?;

        let client = self.pool.client(&entry.server_id).ok_or_else(|| {
            HostError::new(ErrorCode::ServerDisconnected, "Server not connected")
        })?;

        let local_name = split_qualified_name(qualified_name)
            .map(|(_, local)| local)
            .unwrap_or(qualified_name);

        self.registries.prompts.record_usage(qualified_name);
        client
            .get_prompt(local_name, arguments)
            .await
            .map_err(|err| HostError::new(err.code, err.message))
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, HostError> {
        let entry = self
            .registries
            .resources
            .find(uri)
            .ok_or_else(|| HostError::not_found(format!("Resource not found: {uri}")))?;

        let client = self.pool.client(&entry.server_id).ok_or_else(|| {
            HostError::new(ErrorCode::ServerDisconnected, "Server not connected")
        })?;

        self.registries.resources.record_usage(uri);
        client
            .read_resource(uri)
            .await
            .map_err(|err| HostError::new(err.code, err.message))
    }

    async fn sample(&self, request: SamplingRequest) -> Result<SamplingResponse, HostError> {
        self.sampler.sample(request).await
    }
}
