//! Vector source: embedding database adapter.
//!
//! Chunks are embedded through the configured [`EmbeddingProvider`] and
//! stored in the source's own SQLite database (WAL mode, f16 embedding
//! blobs), keyed by chunk id. Queries embed the text once and brute-force
//! cosine over the stored vectors.
//!
//! Staleness: every row carries the blob id its chunk was cut from. The
//! engine refreshes the current `path → blob` view after each scan, and
//! query results whose stored blob id no longer matches are silently
//! dropped, so a reader can never see lines from a superseded blob.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use half::f16;
use kelp_context::Chunk;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};

use super::{with_retry, Hit, SearchSource, SourceKind};
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, RetrieverError};

/// Default number of chunks per upsert batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Hits scoring below this similarity are noise, not neighbors. With
/// `1 / (1 + distance)`, unrelated text lands near 0.5.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.55;

/// Embedding-database adapter over SQLite.
pub struct VectorSource {
    pool: SqlitePool,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    min_similarity: f32,
    current_blobs: RwLock<HashMap<String, String>>,
}

impl VectorSource {
    /// Open (and create) the store at the given database path.
    pub async fn open(
        db_path: &Path,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::with_pool(pool, provider, batch_size).await
    }

    /// In-memory store for tests.
    pub async fn open_memory(
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::with_pool(pool, provider, batch_size).await
    }

    async fn with_pool(
        pool: SqlitePool,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                content TEXT NOT NULL,
                blob_id TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            provider,
            batch_size: batch_size.max(1),
            min_similarity: DEFAULT_MIN_SIMILARITY,
            current_blobs: RwLock::new(HashMap::new()),
        })
    }

    /// Override the similarity floor below which hits are discarded.
    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    /// Refresh the current `path → blob id` view used by the staleness
    /// filter. Called by the engine after every scan.
    pub fn set_current_blobs(&self, blobs: HashMap<String, String>) {
        *self.current_blobs.write().unwrap() = blobs;
    }

    /// What the store believes is indexed: one `path → blob id` entry per
    /// path. Drives the engine's change diff.
    pub async fn paths_and_blobs(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT DISTINCT path, blob_id FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("path"), row.get::<String, _>("blob_id")))
            .collect())
    }

    /// Remove every chunk for a path, returning the removed chunk ids.
    pub async fn purge_path(&self, path: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT chunk_id FROM chunks WHERE path = ?1")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;
        let ids: Vec<String> = rows.into_iter().map(|r| r.get("chunk_id")).collect();
        sqlx::query("DELETE FROM chunks WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Number of chunks currently stored.
    pub async fn chunk_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn fetch_all_rows(&self) -> Result<Vec<sqlx::sqlite::SqliteRow>> {
        let rows = sqlx::query("SELECT path, start_line, blob_id, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn write_batch(&self, batch: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            let halves: Vec<f16> = embedding.iter().map(|v| f16::from_f32(*v)).collect();
            let blob: &[u8] = bytemuck::cast_slice(&halves);
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, path, start_line, content, blob_id, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    path = excluded.path,
                    start_line = excluded.start_line,
                    content = excluded.content,
                    blob_id = excluded.blob_id,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(chunk.start_line as i64)
            .bind(&chunk.text)
            .bind(&chunk.blob_id)
            .bind(blob.to_vec())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SearchSource for VectorSource {
    async fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.provider.embed_texts(&texts).await?;
            if embeddings.len() != batch.len() {
                return Err(RetrieverError::internal(format!(
                    "provider {} returned {} embeddings for {} chunks",
                    self.provider.name(),
                    embeddings.len(),
                    batch.len()
                )));
            }
            with_retry("vector upsert", || self.write_batch(batch, &embeddings)).await?;
        }
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<Hit>> {
        let embeddings = self.provider.embed_texts(&[text.to_string()]).await?;
        let query_vec = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RetrieverError::internal("provider returned no query embedding"))?;

        let rows = with_retry("vector query", || self.fetch_all_rows()).await?;

        let current = self.current_blobs.read().unwrap();
        let mut hits: Vec<Hit> = Vec::new();
        for row in rows {
            let path: String = row.get("path");
            let blob_id: String = row.get("blob_id");
            // Stale chunks are dropped silently: either the path is gone
            // from HEAD or its blob was superseded.
            match current.get(&path) {
                Some(blob) if *blob == blob_id => {}
                _ => continue,
            }
            let bytes: Vec<u8> = row.get("embedding");
            let stored: Vec<f32> = bytemuck::cast_slice::<u8, f16>(&bytes)
                .iter()
                .map(|h| h.to_f32())
                .collect();
            let distance = 1.0 - cosine_similarity(&query_vec, &stored);
            let score = (1.0 / (1.0 + distance)).clamp(0.0, 1.0);
            if score < self.min_similarity {
                continue;
            }
            hits.push(Hit {
                path,
                line: row.get::<i64, _>("start_line") as u32,
                score,
                source: SourceKind::Vector,
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<()> {
        for batch in chunk_ids.chunks(DEFAULT_BATCH_SIZE) {
            let placeholders = (1..=batch.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("DELETE FROM chunks WHERE chunk_id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
