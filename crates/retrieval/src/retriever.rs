//! Retriever: query text in, ranked context out
//!
//! Embeds the query, searches the index, then merges session highlights in
//! above every vector hit. Highlights never compete on score — the user
//! pinned them on purpose — so they carry a fixed 1.0 and are exempt from
//! the threshold. Duplicates collapse by chunk id and by content hash.

use crate::embedder::Embedder;
use crate::index::{SearchHit, VectorIndex};
use docpilot_common::errors::{AppError, Result};
use docpilot_common::metrics::record_retrieval;
use docpilot_common::types::{sha256_hex, ContextChunk, Retrieval, RetrievedItem, MAX_HIGHLIGHTS};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Source label carried by highlight-backed items
pub const HIGHLIGHT_SOURCE: &str = "session-highlight";

/// Backoff before the single retry on backend failure
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Parameters for one retrieval
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    /// Query text (already validated upstream)
    pub query: String,

    /// Live highlights for the session, oldest first
    pub highlights: Vec<ContextChunk>,

    /// Vector hits requested from the index
    pub top_k: usize,

    /// Hits scoring below this are discarded
    pub min_score: f32,

    /// Cap on merged items handed to generation
    pub max_items: usize,
}

/// Retrieval stage interface; the cached decorator wraps this
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, request: &RetrieveRequest) -> Result<Retrieval>;
}

/// The real retriever: embedder + vector index
pub struct VectorRetriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Embed + search, retried once after a short backoff
    async fn search_with_retry(&self, request: &RetrieveRequest) -> Result<Vec<SearchHit>> {
        match self.try_search(request).await {
            Ok(hits) => Ok(hits),
            Err(first) => {
                warn!(error = %first, "Retrieval backend failed, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.try_search(request).await.map_err(|e| AppError::Retrieval {
                    message: format!("retry failed: {}", e),
                })
            }
        }
    }

    async fn try_search(&self, request: &RetrieveRequest) -> Result<Vec<SearchHit>> {
        let embedding = self.embedder.embed(&request.query).await?;
        self.index
            .search(&embedding, request.top_k, request.min_score)
            .await
    }

    /// Merge highlights above vector hits, dropping duplicates by chunk id
    /// and by content hash, respecting the item cap
    fn merge(request: &RetrieveRequest, hits: Vec<SearchHit>) -> Vec<RetrievedItem> {
        let mut items = Vec::new();
        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut seen_hashes: HashSet<String> = HashSet::new();

        for highlight in request.highlights.iter().take(MAX_HIGHLIGHTS) {
            if items.len() >= request.max_items {
                break;
            }
            if !seen_hashes.insert(sha256_hex(&highlight.text)) {
                continue;
            }
            seen_ids.insert(highlight.id);
            items.push(RetrievedItem {
                chunk_id: highlight.id,
                text: highlight.text.clone(),
                source_path: HIGHLIGHT_SOURCE.to_string(),
                heading_path: Vec::new(),
                relevance_score: 1.0,
            });
        }

        for hit in hits {
            if items.len() >= request.max_items {
                break;
            }
            if !seen_ids.insert(hit.chunk_id) {
                continue;
            }
            // A highlight with identical text wins over its indexed twin
            if !seen_hashes.insert(hit.payload.content_hash.clone()) {
                continue;
            }
            items.push(hit.into_retrieved_item());
        }

        items
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    #[instrument(skip_all, fields(query_len = request.query.len(), highlights = request.highlights.len()))]
    async fn retrieve(&self, request: &RetrieveRequest) -> Result<Retrieval> {
        let start = Instant::now();

        let hits = self.search_with_retry(request).await?;
        let items = Self::merge(request, hits);
        let has_relevant_content = !items.is_empty();

        record_retrieval(start.elapsed().as_secs_f64(), items.len(), has_relevant_content);
        debug!(
            items = items.len(),
            has_relevant_content, "Retrieval complete"
        );

        Ok(Retrieval {
            items,
            has_relevant_content,
        })
    }
}
