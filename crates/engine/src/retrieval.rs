//! Similarity search against the narrative vector index
//!
//! The narrative pipeline talks to the index through [`VectorIndex`] so
//! the Postgres-backed implementation can be swapped for an in-memory
//! one in tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use tandem_common::db::DbPool;
use tandem_common::embeddings::Embedder;
use tandem_common::errors::{AppError, Result};

/// A retrieved passage with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub text: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top `k` passages for `query` within one document, scored by
    /// cosine similarity and sorted best first.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        document_id: Uuid,
    ) -> Result<Vec<ScoredPassage>>;
}

/// pgvector-backed index over the `narrative_chunks` table.
pub struct PgVectorIndex {
    pool: DbPool,
    embedder: Arc<dyn Embedder>,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        document_id: Uuid,
    ) -> Result<Vec<ScoredPassage>> {
        let embedding = self.embedder.embed(query).await?;
        let vector = pgvector::Vector::from(embedding);

        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT content, 1 - (embedding <=> $1) AS score \
             FROM narrative_chunks \
             WHERE document_id = $2 \
             ORDER BY embedding <=> $1 \
             LIMIT $3",
        )
        .bind(&vector)
        .bind(document_id)
        .bind(k as i64)
        .fetch_all(self.pool.inner())
        .await
        .map_err(|err| AppError::DatabaseConnection {
            message: format!("vector search failed: {err}"),
        })?;

        Ok(rows
            .into_iter()
            .map(|(text, score)| ScoredPassage {
                text,
                score: score as f32,
            })
            .collect())
    }
}

/// In-memory index for tests. Passages carry fixed scores; searches
/// filter by document, sort by score, and count invocations.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    passages: Vec<(Uuid, ScoredPassage)>,
    fail: Option<fn() -> AppError>,
    calls: AtomicUsize,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index whose every search fails with the given error.
    pub fn failing(make_error: fn() -> AppError) -> Self {
        Self {
            fail: Some(make_error),
            ..Self::default()
        }
    }

    pub fn with_passage(mut self, document_id: Uuid, text: &str, score: f32) -> Self {
        self.passages.push((
            document_id,
            ScoredPassage {
                text: text.to_string(),
                score,
            },
        ));
        self
    }

    /// Number of searches issued against this index.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn similarity_search(
        &self,
        _query: &str,
        k: usize,
        document_id: Uuid,
    ) -> Result<Vec<ScoredPassage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(make_error) = self.fail {
            return Err(make_error());
        }
        let mut matches: Vec<ScoredPassage> = self
            .passages
            .iter()
            .filter(|(doc, _)| *doc == document_id)
            .map(|(_, passage)| passage.clone())
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }
}
