//! Documentation ingestion: scanning, deterministic chunking, embedding,
//! and vector-index upkeep.
//!
//! The [`IngestPipeline`] ties the stages together; the `ingest` binary
//! wraps it for the command line.

pub mod chunker;
pub mod pipeline;
pub mod scanner;

pub use chunker::{ChunkStore, ChunkerConfig};
pub use pipeline::{IngestPipeline, IngestReport};
pub use scanner::{scan_source_tree, SourceFile};
