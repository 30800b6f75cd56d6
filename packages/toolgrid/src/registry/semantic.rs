use std::sync::Arc;

use tracing::instrument;

use toolgrid_types::{EntityType, PromptEntry, ResourceEntry, SearchHit, ToolEntry};

use super::embedder::{EmbedError, Embedder};
use super::Registries;
use crate::storage::embeddings::{EmbeddingRow, EmbeddingStore};
use crate::storage::StorageError;

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error("semantic search is not configured (no embeddings key)")]
    Disabled,
    #[error("embed: {0}")]
    Embed(#[from] EmbedError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

pub struct SearchOptions {
    pub types: Vec<EntityType>,
    pub limit: usize,
    pub threshold: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            limit: 10,
            threshold: 0.3,
        }
    }
}

/// Embedding-backed discovery across tools, resources and prompts.
/// Present but inert when no embedder is configured.
pub struct SemanticIndex {
    embedder: Option<Arc<dyn Embedder>>,
    store: EmbeddingStore,
}

impl SemanticIndex {
    pub fn new(embedder: Option<Arc<dyn Embedder>>, store: EmbeddingStore) -> Self {
        Self { embedder, store }
    }

    pub fn enabled(&self) -> bool {
        self.embedder.is_some()
    }

    /// Indexes a server's current entries; call after registration.
    #[instrument(level = "debug", skip_all, fields(subsys = "SemanticIndex"))]
    pub async fn index_server(
        &self,
        registries: &Registries,
        server_id: &toolgrid_types::ServerId,
    ) -> Result<usize, SearchError> {
        let Some(embedder) = &self.embedder else {
            return Ok(0);
        };

        let mut ids = Vec::new();
        let mut texts = Vec::new();

        for tool in registries.tools.find_by_server(server_id) {
            ids.push((EntityType::Tool, tool.qualified_name.clone()));
            texts.push(tool_text(&tool));
        }
        for resource in registries.resources.find_by_server(server_id) {
            ids.push((EntityType::Resource, resource.uri.clone()));
            texts.push(resource_text(&resource));
        }
        for prompt in registries.prompts.find_by_server(server_id) {
            ids.push((EntityType::Prompt, prompt.qualified_name.clone()));
            texts.push(prompt_text(&prompt));
        }

        if texts.is_empty() {
            return Ok(0);
        }

        let vectors = embedder.embed(&texts).await?;
        for ((entity_type, entity_id), embedding) in ids.into_iter().zip(vectors) {
            self.store.upsert(&EmbeddingRow {
                entity_type,
                entity_id,
                embedding,
                model: embedder.model().to_string(),
            })?;
        }

        Ok(texts.len())
    }

    /// Cosine-ranked lookup, stale rows (no longer-live entities) skipped.
    #[instrument(level = "debug", skip_all, fields(subsys = "SemanticIndex"))]
    pub async fn search(
        &self,
        registries: &Registries,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let embedder = self.embedder.as_ref().ok_or(SearchError::Disabled)?;

        let query_vec = embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::BadResponse("empty embedding response".to_string()))?;

        let rows = self.store.all_of_types(&options.types)?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter_map(|row| {
                let score = cosine_similarity(&query_vec, &row.embedding)?;
                if score < options.threshold {
                    return None;
                }
                let entity = resolve_entity(registries, row.entity_type, &row.entity_id)?;
                Some(SearchHit {
                    entity_type: row.entity_type,
                    entity_id: row.entity_id,
                    score,
                    entity,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(options.limit);
        Ok(hits)
    }

    /// Wipes and rebuilds the index for everything currently registered.
    pub async fn reindex_all(&self, registries: &Registries) -> Result<usize, SearchError> {
        if self.embedder.is_none() {
            return Err(SearchError::Disabled);
        }
        self.store.clear()?;

        let mut server_ids: Vec<toolgrid_types::ServerId> = registries
            .tools
            .all()
            .into_iter()
            .map(|t| t.server_id)
            .chain(registries.resources.all().into_iter().map(|r| r.server_id))
            .chain(registries.prompts.all().into_iter().map(|p| p.server_id))
            .collect();
        server_ids.sort();
        server_ids.dedup();

        let mut total = 0;
        for server_id in server_ids {
            total += self.index_server(registries, &server_id).await?;
        }
        Ok(total)
    }

    pub fn remove_entity(&self, entity_type: EntityType, entity_id: &str) {
        if let Err(err) = self.store.remove_entity(entity_type, entity_id) {
            tracing::warn!(?err, entity_id, "failed to remove embedding row");
        }
    }
}

/// Canonical text form fed to the embedder.
fn tool_text(tool: &ToolEntry) -> String {
    format!(
        "{}: {}. Tags: {}. Category: {}",
        tool.qualified_name,
        tool.description.as_deref().unwrap_or(""),
        tool.tags.join(", "),
        tool.category.as_deref().unwrap_or(""),
    )
}

fn resource_text(resource: &ResourceEntry) -> String {
    format!(
        "{}: {}. Tags: {}. Category: {}",
        resource.name,
        resource.description.as_deref().unwrap_or(""),
        resource.tags.join(", "),
        resource.category.as_deref().unwrap_or(""),
    )
}

fn prompt_text(prompt: &PromptEntry) -> String {
    format!(
        "{}: {}. Tags: {}. Category: {}",
        prompt.qualified_name,
        prompt.description.as_deref().unwrap_or(""),
        prompt.tags.join(", "),
        prompt.category.as_deref().unwrap_or(""),
    )
}

fn resolve_entity(
    registries: &Registries,
    entity_type: EntityType,
    entity_id: &str,
) -> Option<serde_json::Value> {
    match entity_type {
        EntityType::Tool => registries
            .tools
            .find(entity_id)
            .and_then(|e| serde_json::to_value(e).ok()),
        EntityType::Resource => registries
            .resources
            .find(entity_id)
            .and_then(|e| serde_json::to_value(e).ok()),
        EntityType::Prompt => registries
            .prompts
            .find(entity_id)
            .and_then(|e| serde_json::to_value(e).ok()),
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CatalogTool, ServerCatalog};
    use crate::storage::{migrations, Db};
    use async_trait::async_trait;
    use toolgrid_types::{ServerConfig, ServerId, TransportConfig};

    /// Deterministic embedder: maps known words onto fixed axes.
    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model(&self) -> &str {
            "stub-embed"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    vec![
                        lower.matches("weather").count() as f32,
                        lower.matches("file").count() as f32,
                        1.0,
                    ]
                })
                .collect())
        }
    }

    fn setup() -> (SemanticIndex, Registries, ServerId) {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        let index = SemanticIndex::new(Some(Arc::new(StubEmbedder)), EmbeddingStore::new(db));

        let registries = Registries::new();
        let server = ServerConfig {
            id: ServerId::generate(),
            name: "hub".to_string(),
            transport: TransportConfig::Http {
                url: "http://localhost:4000".to_string(),
                headers: Default::default(),
            },
            auth: None,
            health_check: Default::default(),
            rate_limits: Default::default(),
            metadata: Default::default(),
            group_id: None,
            enabled: true,
        };
        registries.register_server(
            &server,
            &ServerCatalog {
                tools: vec![
                    CatalogTool {
                        name: "weather-current".to_string(),
                        description: Some("weather weather report".to_string()),
                        schema: None,
                    },
                    CatalogTool {
                        name: "file-read".to_string(),
                        description: Some("file file contents".to_string()),
                        schema: None,
                    },
                ],
                resources: Vec::new(),
                prompts: Vec::new(),
            },
        );
        let id = server.id.clone();
        (index, registries, id)
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_skips_stale() {
        let (index, registries, server_id) = setup();
        let indexed = index.index_server(&registries, &server_id).await.unwrap();
        assert_eq!(indexed, 2);

        let hits = index
            .search(&registries, "weather", SearchOptions::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entity_id, "hub/weather-current");

        // unregister and search again: rows are stale, hits disappear
        registries.unregister_server(&server_id);
        let hits = index
            .search(&registries, "weather", SearchOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn threshold_and_limit_apply() {
        let (index, registries, server_id) = setup();
        index.index_server(&registries, &server_id).await.unwrap();

        let hits = index
            .search(
                &registries,
                "weather",
                SearchOptions {
                    types: Vec::new(),
                    limit: 1,
                    threshold: 0.0,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn disabled_index_errors_on_search() {
        let db = Db::open_in_memory().unwrap();
        migrations::apply(&db).unwrap();
        let index = SemanticIndex::new(None, EmbeddingStore::new(db));
        let registries = Registries::new();

        assert!(matches!(
            index
                .search(&registries, "anything", SearchOptions::default())
                .await,
            Err(SearchError::Disabled)
        ));
    }
}
