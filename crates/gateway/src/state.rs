//! Shared application state and service wiring

use std::sync::Arc;

use async_trait::async_trait;
use docpilot_common::cache::CacheStore;
use docpilot_common::config::{AppConfig, RetrievalConfig};
use docpilot_common::db::DbPool;
use docpilot_common::errors::Result;
use docpilot_common::types::RetrievedItem;
use docpilot_conversation::ToolExecutor;
use docpilot_retrieval::{RetrieveRequest, Retriever};

use crate::middleware::rate_limit::IdentityLimiter;
use crate::stream::QueryServices;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<QueryServices>,
    pub identity_limiter: Arc<IdentityLimiter>,

    /// Present only when the index backend needs a database
    pub db: Option<DbPool>,

    /// Present only when Redis is configured and reachable
    pub cache: Option<Arc<dyn CacheStore>>,
}

/// Lets the model pull additional passages mid-generation through the
/// same retriever the query path uses (without session highlights).
pub struct RetrieverTools {
    retriever: Arc<dyn Retriever>,
    config: RetrievalConfig,
}

impl RetrieverTools {
    pub fn new(retriever: Arc<dyn Retriever>, config: RetrievalConfig) -> Self {
        Self { retriever, config }
    }
}

#[async_trait]
impl ToolExecutor for RetrieverTools {
    async fn retrieve_content(&self, query: &str) -> Result<Vec<RetrievedItem>> {
        let request = RetrieveRequest {
            query: query.to_string(),
            highlights: Vec::new(),
            top_k: self.config.top_k,
            min_score: self.config.min_score,
            max_items: self.config.max_items,
        };
        Ok(self.retriever.retrieve(&request).await?.items)
    }
}
