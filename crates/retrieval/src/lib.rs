//! docpilot retrieval layer
//!
//! Turns query text into scored documentation chunks:
//! - [`embedder`] — embedding providers behind the [`Embedder`] trait
//! - [`index`] — vector index backends behind the [`VectorIndex`] trait
//! - [`retriever`] — threshold filtering, highlight merging, deduplication
//! - [`cached`] — cache decorators for the embedder and retriever

pub mod cached;
pub mod embedder;
pub mod index;
pub mod retriever;

pub use cached::{CachedEmbedder, CachedRetriever};
pub use embedder::{create_embedder, Embedder, MockEmbedder, OpenAiEmbedder};
pub use index::{
    create_index, ChunkPayload, InMemoryIndex, PgVectorIndex, SearchHit, VectorIndex, VectorRecord,
};
pub use retriever::{RetrieveRequest, Retriever, VectorRetriever, HIGHLIGHT_SOURCE};
