//! Core domain types shared across docpilot crates
//!
//! The pipeline hands these between stages: ingestion produces
//! [`ContentChunk`]s, retrieval produces [`RetrievedItem`]s, and the
//! conversation layer consumes both alongside session history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace for deterministic chunk ids. Fixed forever; changing it would
/// orphan every indexed chunk on the next ingestion run.
pub const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c1d2a_9b7e_4f60_a1c5_d4e8b2f97310);

/// Rough token estimate (~4 chars per token for English/code mix)
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4).max(1) as u32
}

/// Hex-encoded SHA-256 of a text, used for content identity and cache keys
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A contiguous span of documentation text produced by ingestion.
///
/// Immutable once emitted; re-ingestion supersedes a chunk by upserting the
/// same deterministic id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentChunk {
    /// Deterministic id derived from `source_path` and `chunk_index`
    pub id: Uuid,

    /// Chunk text (never empty)
    pub text: String,

    /// Source file path, relative to the docs root, `/`-separated
    pub source_path: String,

    /// Ancestor headings active where this chunk starts
    pub heading_path: Vec<String>,

    /// Position of this chunk within its source file
    pub chunk_index: u32,

    /// Hex SHA-256 of `text`, used for change detection
    pub content_hash: String,

    /// Estimated token count of `text`
    pub token_count: u32,
}

impl ContentChunk {
    /// Deterministic chunk id: UUIDv5 of `source_path#chunk_index`.
    /// Identical input text at the same position always reproduces it.
    pub fn deterministic_id(source_path: &str, chunk_index: u32) -> Uuid {
        let name = format!("{source_path}#{chunk_index}");
        Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes())
    }

    pub fn new(text: String, source_path: String, heading_path: Vec<String>, chunk_index: u32) -> Self {
        let content_hash = sha256_hex(&text);
        let token_count = estimate_tokens(&text);
        Self {
            id: Self::deterministic_id(&source_path, chunk_index),
            text,
            source_path,
            heading_path,
            chunk_index,
            content_hash,
            token_count,
        }
    }
}

/// A chunk returned by retrieval for one query, scored and ready for
/// prompt assembly. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Originating chunk id; for session highlights this is the highlight id
    pub chunk_id: Uuid,

    /// Chunk text
    pub text: String,

    /// Source file path ("session highlight" sentinel for pinned context)
    pub source_path: String,

    /// Ancestor headings for citation display
    pub heading_path: Vec<String>,

    /// Relevance score in [0, 1]; highlights are pinned to 1.0
    pub relevance_score: f32,
}

impl RetrievedItem {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            source_path: self.source_path.clone(),
            heading_path: self.heading_path.clone(),
            relevance_score: self.relevance_score,
        }
    }
}

/// Citation-facing reference to a source location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub source_path: String,
    pub heading_path: Vec<String>,
    pub relevance_score: f32,
}

/// Result of the retrieval stage for one query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Retrieval {
    /// Merged, deduplicated items in descending relevance order
    pub items: Vec<RetrievedItem>,

    /// False when nothing cleared the score threshold and no highlights
    /// exist; downstream must not fabricate content in that case
    pub has_relevant_content: bool,
}

/// Speaker role for a history entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in a session's bounded history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    /// Sources cited by an assistant entry (empty for user entries)
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

/// A passage the user pinned as conversational context.
///
/// At most [`MAX_HIGHLIGHTS`] live per session; oldest evicted first.
/// Expires on its own TTL, independent of session expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: Uuid,
    pub session_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ContextChunk {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Live highlights allowed per session
pub const MAX_HIGHLIGHTS: usize = 5;

/// Client-tunable generation parameters, clamped server-side
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl GenerationParams {
    pub const MAX_TOKENS_RANGE: (u32, u32) = (16, 4096);
    pub const TEMPERATURE_RANGE: (f32, f32) = (0.0, 2.0);

    /// Clamp both knobs into their allowed ranges
    pub fn clamped(self) -> Self {
        Self {
            max_tokens: self
                .max_tokens
                .map(|t| t.clamp(Self::MAX_TOKENS_RANGE.0, Self::MAX_TOKENS_RANGE.1)),
            temperature: self
                .temperature
                .map(|t| t.clamp(Self::TEMPERATURE_RANGE.0, Self::TEMPERATURE_RANGE.1)),
        }
    }
}

/// One completed query/response exchange, recorded into session history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTurn {
    pub query_text: String,
    pub require_sources: bool,
    pub resolved_session_id: Uuid,
    pub retrieved_items: Vec<SourceRef>,
    pub response_text: String,
    pub response_time_ms: u64,
    pub has_relevant_content: bool,
}

/// Final answer assembled by the conversation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub response_text: String,

    /// Sources actually used, citation-ordered
    pub sources: Vec<SourceRef>,

    pub has_relevant_content: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_chunk_id() {
        let a = ContentChunk::deterministic_id("guides/install.md", 3);
        let b = ContentChunk::deterministic_id("guides/install.md", 3);
        let c = ContentChunk::deterministic_id("guides/install.md", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_content_hash_tracks_text() {
        let one = ContentChunk::new("alpha".into(), "a.md".into(), vec![], 0);
        let two = ContentChunk::new("alpha".into(), "a.md".into(), vec![], 0);
        let three = ContentChunk::new("beta".into(), "a.md".into(), vec![], 0);
        assert_eq!(one.content_hash, two.content_hash);
        assert_ne!(one.content_hash, three.content_hash);
        assert_eq!(one.id, three.id); // same position, superseded via upsert
    }

    #[test]
    fn test_generation_params_clamped() {
        let params = GenerationParams {
            max_tokens: Some(1_000_000),
            temperature: Some(-3.5),
        };
        let clamped = params.clamped();
        assert_eq!(clamped.max_tokens, Some(4096));
        assert_eq!(clamped.temperature, Some(0.0));
    }

    #[test]
    fn test_token_estimate_never_zero() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
