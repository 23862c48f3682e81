//! In-memory vector index
//!
//! Brute-force cosine scan over a HashMap. Fine for tests and corpora in
//! the low tens of thousands of chunks.

use super::{ChunkPayload, SearchHit, VectorIndex, VectorRecord};
use docpilot_common::errors::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Cosine similarity between two vectors; 0.0 when either norm is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<HashMap<Uuid, VectorRecord>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.chunk_id, record.clone());
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<SearchHit>> {
        let map = self.records.read().await;

        let mut hits: Vec<SearchHit> = map
            .values()
            .map(|record| SearchHit {
                chunk_id: record.chunk_id,
                score: cosine_similarity(query, &record.embedding),
                payload: record.payload.clone(),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_missing(&self, known_ids: &HashSet<Uuid>) -> Result<u64> {
        let mut map = self.records.write().await;
        let before = map.len();
        map.retain(|id, _| known_ids.contains(id));
        Ok((before - map.len()) as u64)
    }

    async fn list_content_hashes(&self) -> Result<HashMap<Uuid, String>> {
        let map = self.records.read().await;
        Ok(map
            .iter()
            .map(|(id, record)| (*id, record.payload.content_hash.clone()))
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpilot_common::types::sha256_hex;

    fn record(id: Uuid, text: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: id,
            embedding,
            payload: ChunkPayload {
                text: text.to_string(),
                source_path: "docs/test.md".to_string(),
                heading_path: vec!["Test".to_string()],
                chunk_index: 0,
                content_hash: sha256_hex(text),
                token_count: 1,
            },
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = InMemoryIndex::new();
        let id = Uuid::new_v4();

        index.upsert(&[record(id, "alpha", vec![1.0, 0.0])]).await.unwrap();
        index.upsert(&[record(id, "alpha", vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);

        // Replacing with new content keeps a single live record
        index.upsert(&[record(id, "beta", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hashes = index.list_content_hashes().await.unwrap();
        assert_eq!(hashes[&id], sha256_hex("beta"));
    }

    #[tokio::test]
    async fn test_search_orders_and_filters() {
        let index = InMemoryIndex::new();
        let close = Uuid::new_v4();
        let closer = Uuid::new_v4();
        let orthogonal = Uuid::new_v4();

        index
            .upsert(&[
                record(close, "close", vec![0.8, 0.6]),
                record(closer, "closer", vec![1.0, 0.0]),
                record(orthogonal, "orthogonal", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 10, 0.5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, closer);
        assert_eq!(hits[1].chunk_id, close);
        // The orthogonal record scored 0.0, below the threshold
        assert!(hits.iter().all(|h| h.chunk_id != orthogonal));
    }

    #[tokio::test]
    async fn test_search_respects_top_k() {
        let index = InMemoryIndex::new();
        for _ in 0..5 {
            index
                .upsert(&[record(Uuid::new_v4(), "x", vec![1.0, 0.0])])
                .await
                .unwrap();
        }
        let hits = index.search(&[1.0, 0.0], 3, 0.0).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let index = InMemoryIndex::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();

        index
            .upsert(&[
                record(keep, "keep", vec![1.0, 0.0]),
                record(drop, "drop", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let mut known = HashSet::new();
        known.insert(keep);

        let removed = index.delete_missing(&known).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.count().await.unwrap(), 1);
        assert!(index.list_content_hashes().await.unwrap().contains_key(&keep));
    }
}
