//! Postgres + pgvector index backend
//!
//! Talks to pgvector through raw SQL statements; the `vector` type has no
//! SeaORM mapping, so embeddings cross the wire as `[f32,...]` literals cast
//! with `::vector`.

use super::{ChunkPayload, SearchHit, VectorIndex, VectorRecord};
use docpilot_common::db::DbPool;
use docpilot_common::errors::Result;
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

const DELETE_BATCH: usize = 500;

/// Format an embedding as a pgvector literal: "[0.1,0.2,...]"
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

pub struct PgVectorIndex {
    pool: DbPool,
    dimension: usize,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }

    /// Create the extension, table, and indexes if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS doc_chunks (
                    id UUID PRIMARY KEY,
                    content TEXT NOT NULL,
                    source_path TEXT NOT NULL,
                    heading_path JSONB NOT NULL DEFAULT '[]',
                    chunk_index INTEGER NOT NULL,
                    content_hash TEXT NOT NULL,
                    token_count INTEGER NOT NULL,
                    embedding vector({}),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                self.dimension
            ),
            "CREATE INDEX IF NOT EXISTS doc_chunks_embedding_idx \
             ON doc_chunks USING hnsw (embedding vector_cosine_ops)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS doc_chunks_source_path_idx \
             ON doc_chunks (source_path)"
                .to_string(),
        ];

        for statement in &ddl {
            self.pool.conn().execute_unprepared(statement).await?;
        }

        info!(dimension = self.dimension, "pgvector schema ready");
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        for record in records {
            let heading_path = serde_json::to_value(&record.payload.heading_path)?;

            let stmt = Statement::from_sql_and_values(
                DbBackend::Postgres,
                r#"
                INSERT INTO doc_chunks (
                    id, content, source_path, heading_path,
                    chunk_index, content_hash, token_count, embedding, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8::vector, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    content = EXCLUDED.content,
                    source_path = EXCLUDED.source_path,
                    heading_path = EXCLUDED.heading_path,
                    chunk_index = EXCLUDED.chunk_index,
                    content_hash = EXCLUDED.content_hash,
                    token_count = EXCLUDED.token_count,
                    embedding = EXCLUDED.embedding,
                    updated_at = NOW()
                "#,
                vec![
                    record.chunk_id.into(),
                    record.payload.text.clone().into(),
                    record.payload.source_path.clone().into(),
                    heading_path.into(),
                    (record.payload.chunk_index as i32).into(),
                    record.payload.content_hash.clone().into(),
                    (record.payload.token_count as i32).into(),
                    vector_literal(&record.embedding).into(),
                ],
            );

            self.pool.conn().execute(stmt).await?;
        }

        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize, min_score: f32) -> Result<Vec<SearchHit>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT
                id, content, source_path, heading_path,
                chunk_index, content_hash, token_count,
                1 - (embedding <=> $1::vector) AS score
            FROM doc_chunks
            WHERE embedding IS NOT NULL
            ORDER BY embedding <=> $1::vector
            LIMIT $2
            "#,
            vec![vector_literal(query).into(), (top_k as i64).into()],
        );

        let hits = self
            .pool
            .conn()
            .query_all(stmt)
            .await?
            .into_iter()
            .filter_map(|row| {
                let heading_path: Vec<String> = row
                    .try_get_by_index::<serde_json::Value>(3)
                    .ok()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();

                Some(SearchHit {
                    chunk_id: row.try_get_by_index::<Uuid>(0).ok()?,
                    score: row.try_get_by_index::<f64>(7).ok()? as f32,
                    payload: ChunkPayload {
                        text: row.try_get_by_index::<String>(1).ok()?,
                        source_path: row.try_get_by_index::<String>(2).ok()?,
                        heading_path,
                        chunk_index: row.try_get_by_index::<i32>(4).ok()? as u32,
                        content_hash: row.try_get_by_index::<String>(5).ok()?,
                        token_count: row.try_get_by_index::<i32>(6).ok()? as u32,
                    },
                })
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        Ok(hits)
    }

    async fn delete_missing(&self, known_ids: &HashSet<Uuid>) -> Result<u64> {
        let stmt = Statement::from_string(DbBackend::Postgres, "SELECT id FROM doc_chunks");

        let stale: Vec<Uuid> = self
            .pool
            .conn()
            .query_all(stmt)
            .await?
            .into_iter()
            .filter_map(|row| row.try_get_by_index::<Uuid>(0).ok())
            .filter(|id| !known_ids.contains(id))
            .collect();

        let mut removed = 0u64;
        for batch in stale.chunks(DELETE_BATCH) {
            let placeholders: Vec<String> =
                (1..=batch.len()).map(|i| format!("${}", i)).collect();
            let sql = format!(
                "DELETE FROM doc_chunks WHERE id IN ({})",
                placeholders.join(", ")
            );
            let values: Vec<sea_orm::Value> = batch.iter().map(|id| (*id).into()).collect();

            let result = self
                .pool
                .conn()
                .execute(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    &sql,
                    values,
                ))
                .await?;
            removed += result.rows_affected();
        }

        Ok(removed)
    }

    async fn list_content_hashes(&self) -> Result<HashMap<Uuid, String>> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            "SELECT id, content_hash FROM doc_chunks",
        );

        let hashes = self
            .pool
            .conn()
            .query_all(stmt)
            .await?
            .into_iter()
            .filter_map(|row| {
                Some((
                    row.try_get_by_index::<Uuid>(0).ok()?,
                    row.try_get_by_index::<String>(1).ok()?,
                ))
            })
            .collect();

        Ok(hashes)
    }

    async fn count(&self) -> Result<u64> {
        let stmt =
            Statement::from_string(DbBackend::Postgres, "SELECT COUNT(*) FROM doc_chunks");

        let count = self
            .pool
            .conn()
            .query_one(stmt)
            .await?
            .and_then(|row| row.try_get_by_index::<i64>(0).ok())
            .unwrap_or(0);

        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal_format() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
