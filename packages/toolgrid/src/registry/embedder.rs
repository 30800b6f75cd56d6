use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("embeddings request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embeddings response: {0}")]
    BadResponse(String),
}

/// The embeddings collaborator. The gateway only needs batch embedding;
/// provider specifics stay behind this trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// OpenAI-compatible `/v1/embeddings` client; active whenever an
/// embeddings API key is configured.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub const DEFAULT_URL: &'static str = "https://api.openai.com/v1/embeddings";
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(api_key: String, url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbedError::BadResponse(format!(
                "status {} from embeddings endpoint",
                response.status()
            )));
        }

        let body: EmbeddingsResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(EmbedError::BadResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        let mut ordered = body.data;
        ordered.sort_by_key(|d| d.index);
        Ok(ordered.into_iter().map(|d| d.embedding).collect())
    }
}
