//! Vector index abstraction
//!
//! Two backends behind one trait:
//! - [`PgVectorIndex`] — Postgres with the pgvector extension
//! - [`InMemoryIndex`] — process-local, for tests and small corpora
//!
//! Swapping backends is a construction-time choice; callers only see
//! [`VectorIndex`].

mod memory;
mod pgvector;

pub use memory::InMemoryIndex;
pub use pgvector::PgVectorIndex;

use docpilot_common::config::AppConfig;
use docpilot_common::db::DbPool;
use docpilot_common::errors::{AppError, Result};
use docpilot_common::types::{ContentChunk, RetrievedItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Chunk metadata stored alongside each embedding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub text: String,
    pub source_path: String,
    pub heading_path: Vec<String>,
    pub chunk_index: u32,
    pub content_hash: String,
    pub token_count: u32,
}

/// One indexed chunk: id, embedding, payload.
///
/// The index holds exactly one live record per `chunk_id`; upserting the
/// same id replaces the previous record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub embedding: Vec<f32>,
    pub payload: ChunkPayload,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &ContentChunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id,
            embedding,
            payload: ChunkPayload {
                text: chunk.text.clone(),
                source_path: chunk.source_path.clone(),
                heading_path: chunk.heading_path.clone(),
                chunk_index: chunk.chunk_index,
                content_hash: chunk.content_hash.clone(),
                token_count: chunk.token_count,
            },
        }
    }
}

/// A scored match from the index
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub score: f32,
    pub payload: ChunkPayload,
}

impl SearchHit {
    pub fn into_retrieved_item(self) -> RetrievedItem {
        RetrievedItem {
            chunk_id: self.chunk_id,
            text: self.payload.text,
            source_path: self.payload.source_path,
            heading_path: self.payload.heading_path,
            relevance_score: self.score,
        }
    }
}

/// Vector index operations
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by `chunk_id`. Re-upserting identical
    /// records leaves the index observably unchanged.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Top-k cosine search. Hits scoring below `min_score` are excluded;
    /// results come back in descending score order.
    async fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<SearchHit>>;

    /// Remove every record whose id is not in `known_ids`. Returns the
    /// number removed. Used to garbage-collect chunks whose source
    /// content disappeared.
    async fn delete_missing(&self, known_ids: &HashSet<Uuid>) -> Result<u64>;

    /// Map of id -> content hash for every live record, for change
    /// detection during re-ingestion.
    async fn list_content_hashes(&self) -> Result<HashMap<Uuid, String>>;

    /// Number of live records
    async fn count(&self) -> Result<u64>;
}

/// Build the configured index backend.
///
/// The pgvector backend needs a database pool; callers that run health
/// checks against the same pool construct it once and pass it in. The
/// memory backend is process-local and only suitable for tests and
/// single-process development.
pub async fn create_index(
    config: &AppConfig,
    pool: Option<DbPool>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.index.backend.as_str() {
        "pgvector" => {
            let pool = pool.ok_or_else(|| AppError::Configuration {
                message: "pgvector index backend requires a database pool".to_string(),
            })?;
            let index = PgVectorIndex::new(pool, config.embedding.dimension);
            if config.index.ensure_schema {
                index.ensure_schema().await?;
            }
            Ok(Arc::new(index))
        }
        "memory" => Ok(Arc::new(InMemoryIndex::new())),
        other => {
            tracing::warn!(backend = %other, "unknown index backend, falling back to memory");
            Ok(Arc::new(InMemoryIndex::new()))
        }
    }
}
