use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostError;

/// Seam between the engine and the gateway runtime. The engine knows how
/// to sequence steps; the host knows how to reach upstreams.
#[async_trait]
pub trait StepHost: Send + Sync {
    /// Invoke `server/tool` with interpolated params.
    async fn call_tool(&self, qualified_name: &str, params: Value) -> Result<Value, HostError>;

    /// Fetch a prompt (`server/prompt`) with rendered arguments.
    async fn get_prompt(&self, qualified_name: &str, arguments: Value) -> Result<Value, HostError>;

    /// Read a resource by URI.
    async fn read_resource(&self, uri: &str) -> Result<Value, HostError>;

    /// Submit an LLM request through the sampling collaborator.
    async fn sample(&self, request: SamplingRequest) -> Result<SamplingResponse, HostError>;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplingResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}
