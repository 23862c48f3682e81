//! Embedding provider abstraction
//!
//! Provides a unified interface over embedding backends:
//! - OpenAI-compatible HTTP APIs (`text-embedding-3-*` and friends)
//! - A deterministic mock for tests and offline development

use docpilot_common::config::EmbeddingConfig;
use docpilot_common::errors::{AppError, Result};
use docpilot_common::metrics::record_embedding;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failures specific to embedding calls. Carries enough detail for the
/// ingestion pipeline to know exactly which inputs were not embedded.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error(
        "embedding failed after {attempts} attempts for inputs {}..={}: {message}",
        .failed_indices.first().copied().unwrap_or(0),
        .failed_indices.last().copied().unwrap_or(0)
    )]
    BatchFailed {
        /// Indices into the caller's input slice that were not embedded
        failed_indices: Vec<usize>,
        attempts: u32,
        message: String,
    },

    #[error("embedding response returned {actual} vectors for {expected} inputs")]
    ShapeMismatch { expected: usize, actual: usize },
}

impl From<EmbeddingError> for AppError {
    fn from(err: EmbeddingError) -> Self {
        AppError::Embedding {
            message: err.to_string(),
        }
    }
}

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts. Output order matches input
    /// order; on failure the whole call fails, nothing is silently dropped.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embedding client
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    batch_size: usize,
    max_retries: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    /// Create a new embedder from configuration
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "embedding.api_key required for the openai provider".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
        })
    }

    /// Make a request with exponential-backoff retry
    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                // Exponential backoff
                let delay = Duration::from_millis(100 * (2_u64.pow(attempt)));
                tokio::time::sleep(delay).await;
            }

            match self.make_request(texts).await {
                Ok(embeddings) => {
                    record_embedding(start.elapsed().as_secs_f64(), &self.model, true);
                    return Ok(embeddings);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        "Embedding request failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        record_embedding(start.elapsed().as_secs_f64(), &self.model, false);
        Err(last_error.unwrap_or_else(|| AppError::Embedding {
            message: "Unknown error after retries".to_string(),
        }))
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Embedding {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Embedding {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: EmbeddingResponse =
            response.json().await.map_err(|e| AppError::Embedding {
                message: format!("Failed to parse response: {}", e),
            })?;

        if result.data.len() != texts.len() {
            return Err(EmbeddingError::ShapeMismatch {
                expected: texts.len(),
                actual: result.data.len(),
            }
            .into());
        }

        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.request_with_retry(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding {
                message: "Empty response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for (batch_idx, chunk) in texts.chunks(self.batch_size).enumerate() {
            let offset = batch_idx * self.batch_size;
            match self.request_with_retry(chunk).await {
                Ok(embeddings) => all_embeddings.extend(embeddings),
                Err(e) => {
                    return Err(EmbeddingError::BatchFailed {
                        failed_indices: (offset..offset + chunk.len()).collect(),
                        attempts: self.max_retries,
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic mock embedder for tests and offline development.
///
/// The vector is seeded from `(model, text)`, so the same text always embeds
/// to the same unit vector and distinct texts land far apart.
pub struct MockEmbedder {
    dimension: usize,
    model: String,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model: "mock-embedding".to_string(),
        }
    }

    fn seeded_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();

        let mut rng = StdRng::from_seed(seed);
        let mut v: Vec<f32> = (0..self.dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.seeded_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.seeded_vector(t)).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("how do I install?").await.unwrap();
        let b = embedder.embed("how do I install?").await.unwrap();
        let c = embedder.embed("completely different").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_mock_embedder_unit_norm() {
        let embedder = MockEmbedder::new(128);
        let v = embedder.embed("anything").await.unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_mock_batch_preserves_order() {
        let embedder = MockEmbedder::new(32);
        let texts = vec!["one".to_string(), "two".to_string(), "one".to_string()];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 3);
        assert_eq!(embeddings[0], embeddings[2]);
        assert_ne!(embeddings[0], embeddings[1]);
    }

    #[test]
    fn test_batch_failed_reports_indices() {
        let err = EmbeddingError::BatchFailed {
            failed_indices: (64..128).collect(),
            attempts: 3,
            message: "API error 500".into(),
        };
        let text = err.to_string();
        assert!(text.contains("64..=127"));
        assert!(text.contains("3 attempts"));
    }

    #[test]
    fn test_factory_requires_api_key() {
        let config = EmbeddingConfig {
            provider: "openai".into(),
            api_key: None,
            api_base: None,
            model: "text-embedding-3-small".into(),
            dimension: 1536,
            timeout_secs: 30,
            max_retries: 3,
            batch_size: 64,
        };
        assert!(create_embedder(&config).is_err());
    }
}
