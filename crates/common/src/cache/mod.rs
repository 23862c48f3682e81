//! Cache layer
//!
//! One interface, two uses: the embedding cache (content-addressed, long
//! TTL) and the retrieval response cache (query-addressed, short TTL).
//! Backends are swappable behind [`CacheStore`]; callers that want
//! fallback-to-source treat errors as misses. A cache-less deployment simply
//! skips the decorator wrapping, so every path works without Redis.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage interface shared by the embedding and response caches.
///
/// Values are JSON strings; [`get_json`]/[`set_json`] layer typed access on
/// top so the trait stays object-safe.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Connectivity probe for readiness checks
    async fn ping(&self) -> Result<()>;
}

/// Typed get through any [`CacheStore`]
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CacheStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get_raw(key).await? {
        Some(json) => {
            let parsed = serde_json::from_str(&json).map_err(|e| AppError::Cache {
                message: format!("Failed to parse cached value: {}", e),
            })?;
            debug!(key = %key, "Cache hit");
            Ok(Some(parsed))
        }
        None => {
            debug!(key = %key, "Cache miss");
            Ok(None)
        }
    }
}

/// Typed set through any [`CacheStore`]
pub async fn set_json<T: Serialize>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let json = serde_json::to_string(value).map_err(|e| AppError::Cache {
        message: format!("Failed to serialize value: {}", e),
    })?;
    store.set_raw(key, json, ttl).await
}

/// Redis-backed cache
pub struct RedisCache {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisCache {
    /// Connect to Redis; the connection manager reconnects on its own
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Cache {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Cache {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            manager,
            key_prefix: "docpilot".to_string(),
        })
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.key(key);
        let mut conn = self.manager.clone();

        let value: Option<String> = conn.get(&full_key).await.map_err(|e| AppError::Cache {
            message: format!("Failed to get key '{}': {}", full_key, e),
        })?;

        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let full_key = self.key(key);
        let mut conn = self.manager.clone();

        conn.set_ex::<_, _, ()>(&full_key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| AppError::Cache {
                message: format!("Failed to set key '{}': {}", full_key, e),
            })?;

        debug!(key = %full_key, ttl_secs = ttl.as_secs(), "Cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.key(key);
        let mut conn = self.manager.clone();

        let deleted: i32 = conn.del(&full_key).await.map_err(|e| AppError::Cache {
            message: format!("Failed to delete key '{}': {}", full_key, e),
        })?;

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::Cache {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }
}

/// In-process TTL map, for tests and single-node deployments.
///
/// Uses the tokio clock so paused-time tests can step expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, tokio::time::Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let now = tokio::time::Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, deadline)) if *deadline > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it under the write lock
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Cache key builders
pub mod keys {
    use crate::types::sha256_hex;
    use uuid::Uuid;

    /// Embedding cache key: content-addressed per model
    pub fn embedding(model: &str, text_hash: &str) -> String {
        format!("embedding:{}:{}", model, text_hash)
    }

    /// Response cache key: normalized query + participating context chunks
    pub fn response(query_hash: &str, context_hash: &str) -> String {
        format!("response:{}:{}", query_hash, context_hash)
    }

    /// Lowercase and collapse whitespace so trivially different phrasings of
    /// the same query share a cache entry
    pub fn normalize_query(query: &str) -> String {
        query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    }

    /// Hash of the normalized query text
    pub fn query_hash(query: &str) -> String {
        sha256_hex(&normalize_query(query))
    }

    /// Hash of the context chunk id set, order-insensitive
    pub fn context_ids_hash(ids: &[Uuid]) -> String {
        if ids.is_empty() {
            return "none".to_string();
        }
        let mut sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        sorted.sort();
        sha256_hex(&sorted.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_key_builders() {
        assert_eq!(
            keys::embedding("text-embedding-3-small", "abc123"),
            "embedding:text-embedding-3-small:abc123"
        );
        assert!(keys::response("qh", "ch").starts_with("response:"));
    }

    #[test]
    fn test_query_normalization() {
        assert_eq!(
            keys::normalize_query("  How do I   Install?\n"),
            "how do i install?"
        );
        assert_eq!(
            keys::query_hash("How do I install?"),
            keys::query_hash("how DO i    install?")
        );
    }

    #[test]
    fn test_context_hash_order_insensitive() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            keys::context_ids_hash(&[a, b]),
            keys::context_ids_hash(&[b, a])
        );
        assert_eq!(keys::context_ids_hash(&[]), "none");
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        set_json(&cache, "k", &vec![1.0f32, 2.0], Duration::from_secs(60))
            .await
            .unwrap();
        let got: Option<Vec<f32>> = get_json(&cache, "k").await.unwrap();
        assert_eq!(got, Some(vec![1.0, 2.0]));
        assert!(cache.delete("k").await.unwrap());
        let gone: Option<Vec<f32>> = get_json(&cache, "k").await.unwrap();
        assert_eq!(gone, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_cache_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_raw("k", "v".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cache.get_raw("k").await.unwrap(), Some("v".into()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_raw("k").await.unwrap(), None);
    }
}
