use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ServerId;

/// A tool offered by an upstream, indexed under `"<serverName>/<toolName>"`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub qualified_name: String,
    pub server_id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Argument schema as reported by the upstream. Opaque to the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

/// A resource offered by an upstream, keyed by URI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    pub uri: String,
    pub server_id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

/// A prompt template offered by an upstream, indexed like tools.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptEntry {
    pub qualified_name: String,
    pub server_id: ServerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Entity kinds the semantic index spans.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Tool,
    Resource,
    Prompt,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tool => "tool",
            EntityType::Resource => "resource",
            EntityType::Prompt => "prompt",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(EntityType::Tool),
            "resource" => Ok(EntityType::Resource),
            "prompt" => Ok(EntityType::Prompt),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// One hit from the semantic index, resolved to its live entity.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub score: f32,
    pub entity: serde_json::Value,
}

pub fn qualified_name(server_name: &str, local_name: &str) -> String {
    format!("{server_name}/{local_name}")
}

/// Splits `"server/tool"` into its halves. Tool names may themselves
/// contain slashes; only the first one separates.
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_splits_on_first_slash() {
        assert_eq!(
            split_qualified_name("files/read/deep"),
            Some(("files", "read/deep"))
        );
        assert_eq!(split_qualified_name("noslash"), None);
    }
}
