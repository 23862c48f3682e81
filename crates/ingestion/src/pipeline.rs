//! Ingestion pipeline
//!
//! One run: scan the tree, chunk every file, diff against the index by
//! content hash, embed what changed in throttled batches, upsert, then
//! garbage-collect records whose source is gone. Running twice on
//! unchanged input leaves the index byte-identical.

use crate::chunker::{ChunkStore, ChunkerConfig};
use crate::scanner::scan_source_tree;
use docpilot_common::config::IngestionConfig;
use docpilot_common::errors::Result;
use docpilot_common::metrics::record_ingestion;
use docpilot_common::types::ContentChunk;
use docpilot_retrieval::{Embedder, VectorIndex, VectorRecord};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use uuid::Uuid;

/// Outcome of one ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub files_scanned: usize,
    pub chunks_total: usize,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
    pub chunks_deleted: u64,
    pub duration_ms: u64,
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunker: ChunkStore,
    config: IngestionConfig,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: IngestionConfig,
    ) -> Self {
        let chunker = ChunkStore::new(ChunkerConfig::from(&config));
        Self {
            embedder,
            index,
            chunker,
            config,
        }
    }

    /// Run one full pass over `root`. A chunk whose id and content hash
    /// already exist in the index skips re-embedding unless `force` is
    /// set. Records for deleted or renamed sources are removed at the
    /// end, after the new state is fully written.
    #[instrument(skip(self), fields(root = %root.display(), force))]
    pub async fn run(&self, root: &Path, force: bool) -> Result<IngestReport> {
        let started = Instant::now();

        let files = scan_source_tree(root, &self.config.extensions)?;
        let mut chunks: Vec<ContentChunk> = Vec::new();
        for file in &files {
            chunks.extend(self.chunker.chunk(&file.text, &file.relative_path));
        }
        let chunks_total = chunks.len();
        let known_ids: HashSet<Uuid> = chunks.iter().map(|c| c.id).collect();

        let existing = self.index.list_content_hashes().await?;
        let (to_embed, skipped): (Vec<_>, Vec<_>) = chunks
            .into_iter()
            .partition(|c| force || existing.get(&c.id) != Some(&c.content_hash));

        let mut written = 0usize;
        for (batch_idx, batch) in to_embed.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_idx > 0 && self.config.batch_delay_ms > 0 {
                // Throttle so the embedding provider sees a steady pace.
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            let records: Vec<VectorRecord> = batch
                .iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding))
                .collect();
            self.index.upsert(&records).await?;
            written += records.len();
        }

        let deleted = self.index.delete_missing(&known_ids).await?;

        let duration = started.elapsed();
        record_ingestion(
            duration.as_secs_f64(),
            files.len(),
            written,
            skipped.len(),
            deleted,
        );
        let report = IngestReport {
            files_scanned: files.len(),
            chunks_total,
            chunks_written: written,
            chunks_skipped: skipped.len(),
            chunks_deleted: deleted,
            duration_ms: duration.as_millis() as u64,
        };
        info!(
            files = report.files_scanned,
            written = report.chunks_written,
            skipped = report.chunks_skipped,
            deleted = report.chunks_deleted,
            duration_ms = report.duration_ms,
            "ingestion run complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docpilot_retrieval::{InMemoryIndex, MockEmbedder};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        inner: MockEmbedder,
        embedded_texts: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                inner: MockEmbedder::new(8),
                embedded_texts: AtomicUsize::new(0),
            }
        }

        fn embedded(&self) -> usize {
            self.embedded_texts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.embedded_texts.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    fn test_config() -> IngestionConfig {
        IngestionConfig {
            target_tokens: 16,
            max_tokens_per_chunk: 64,
            overlap_fraction: 0.0,
            batch_size: 8,
            batch_delay_ms: 0,
            extensions: vec!["md".to_string()],
        }
    }

    fn setup(config: IngestionConfig) -> (Arc<CountingEmbedder>, Arc<InMemoryIndex>, IngestPipeline) {
        let embedder = Arc::new(CountingEmbedder::new());
        let index = Arc::new(InMemoryIndex::new());
        let pipeline = IngestPipeline::new(embedder.clone(), index.clone(), config);
        (embedder, index, pipeline)
    }

    #[tokio::test]
    async fn test_reingest_unchanged_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "Alpha text for the first file.\n").unwrap();
        fs::write(dir.path().join("b.md"), "Bravo text for the second file.\n").unwrap();
        let (embedder, index, pipeline) = setup(test_config());

        let first = pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(first.files_scanned, 2);
        assert_eq!(first.chunks_written, 2);
        assert_eq!(first.chunks_skipped, 0);
        let count = index.count().await.unwrap();
        let embeds = embedder.embedded();

        let second = pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(second.chunks_written, 0);
        assert_eq!(second.chunks_skipped, 2);
        assert_eq!(second.chunks_deleted, 0);
        assert_eq!(index.count().await.unwrap(), count);
        assert_eq!(embedder.embedded(), embeds);

        // Same ids, same hashes after the second pass.
        let hashes = index.list_content_hashes().await.unwrap();
        assert_eq!(hashes.len(), 2);
    }

    #[tokio::test]
    async fn test_force_reembeds_unchanged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "Alpha text for the first file.\n").unwrap();
        let (embedder, index, pipeline) = setup(test_config());

        pipeline.run(dir.path(), false).await.unwrap();
        let embeds = embedder.embedded();

        let forced = pipeline.run(dir.path(), true).await.unwrap();
        assert_eq!(forced.chunks_written, 1);
        assert_eq!(forced.chunks_skipped, 0);
        assert_eq!(embedder.embedded(), embeds + 1);
        // Upsert, not insert: still one record.
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_removed_file_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.md"), "This file stays in place.\n").unwrap();
        fs::write(dir.path().join("drop.md"), "This file will be deleted.\n").unwrap();
        let (_embedder, index, pipeline) = setup(test_config());

        pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        fs::remove_file(dir.path().join("drop.md")).unwrap();
        let second = pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(second.chunks_deleted, 1);
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edited_paragraph_reembeds_only_its_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        fs::write(&path, "Alpha paragraph one.\n\nAlpha paragraph two.\n").unwrap();

        let mut config = test_config();
        // Small target so each paragraph becomes its own chunk.
        config.target_tokens = 4;
        let (embedder, index, pipeline) = setup(config);

        let first = pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(first.chunks_written, 2);
        let embeds = embedder.embedded();

        fs::write(&path, "Alpha paragraph one.\n\nAlpha paragraph two, changed.\n").unwrap();
        let second = pipeline.run(dir.path(), false).await.unwrap();
        assert_eq!(second.chunks_written, 1);
        assert_eq!(second.chunks_skipped, 1);
        assert_eq!(second.chunks_deleted, 0);
        assert_eq!(embedder.embedded(), embeds + 1);
        assert_eq!(index.count().await.unwrap(), 2);
    }
}
