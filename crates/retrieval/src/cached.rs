//! Cache decorators
//!
//! [`CachedEmbedder`] and [`CachedRetriever`] wrap their inner stage with a
//! read-through cache. Cache failures degrade to a miss with a warning, so
//! a dead Redis never takes retrieval down, and a deployment without a cache
//! simply skips the wrapping.

use crate::embedder::Embedder;
use crate::retriever::{Retriever, RetrieveRequest};
use docpilot_common::cache::{self, keys, CacheStore};
use docpilot_common::errors::Result;
use docpilot_common::metrics::record_cache;
use docpilot_common::types::{sha256_hex, Retrieval};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Read a cached value, treating errors as misses
async fn lookup<T: serde::de::DeserializeOwned>(
    store: &dyn CacheStore,
    key: &str,
    cache_name: &str,
) -> Option<T> {
    match cache::get_json::<T>(store, key).await {
        Ok(Some(value)) => {
            record_cache(true, cache_name);
            Some(value)
        }
        Ok(None) => {
            record_cache(false, cache_name);
            None
        }
        Err(e) => {
            warn!(error = %e, key = %key, "Cache read failed, falling back to source");
            record_cache(false, cache_name);
            None
        }
    }
}

/// Write a value to the cache, logging instead of failing
async fn store<T: serde::Serialize>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) {
    if let Err(e) = cache::set_json(store, key, value, ttl).await {
        warn!(error = %e, key = %key, "Cache write failed, continuing without cache");
    }
}

/// Embedder decorator: content-addressed embedding cache
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    fn key(&self, text: &str) -> String {
        keys::embedding(self.inner.model_name(), &sha256_hex(text))
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.key(text);
        if let Some(cached) = lookup::<Vec<f32>>(self.cache.as_ref(), &key, "embedding").await {
            return Ok(cached);
        }

        let embedding = self.inner.embed(text).await?;
        store(self.cache.as_ref(), &key, &embedding, self.ttl).await;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = self.key(text);
            match lookup::<Vec<f32>>(self.cache.as_ref(), &key, "embedding").await {
                Some(cached) => results.push(Some(cached)),
                None => {
                    results.push(None);
                    miss_indices.push(i);
                    miss_texts.push(text.clone());
                }
            }
        }

        if !miss_texts.is_empty() {
            let fresh = self.inner.embed_batch(&miss_texts).await?;
            for (slot, embedding) in miss_indices.iter().zip(fresh) {
                let key = self.key(&texts[*slot]);
                store(self.cache.as_ref(), &key, &embedding, self.ttl).await;
                results[*slot] = Some(embedding);
            }
        }

        // Every slot is filled: hits above, fresh embeddings just now
        Ok(results.into_iter().flatten().collect())
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Retriever decorator: caches the retrieval result keyed by the normalized
/// query plus the participating context chunk ids
pub struct CachedRetriever {
    inner: Arc<dyn Retriever>,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl CachedRetriever {
    pub fn new(inner: Arc<dyn Retriever>, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    fn key(request: &RetrieveRequest) -> String {
        let context_ids: Vec<Uuid> = request.highlights.iter().map(|h| h.id).collect();
        keys::response(
            &keys::query_hash(&request.query),
            &keys::context_ids_hash(&context_ids),
        )
    }
}

#[async_trait]
impl Retriever for CachedRetriever {
    async fn retrieve(&self, request: &RetrieveRequest) -> Result<Retrieval> {
        let key = Self::key(request);
        if let Some(cached) = lookup::<Retrieval>(self.cache.as_ref(), &key, "response").await {
            return Ok(cached);
        }

        let result = self.inner.retrieve(request).await?;
        store(self.cache.as_ref(), &key, &result, self.ttl).await;
        Ok(result)
    }
}
