use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RetrievalError;

/// One record ready for indexing: the embedding plus the payload fields the
/// backends need for filtering and tie-breaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

/// A nearest-neighbor match.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub similarity: f32,
}

/// Optional search constraints, applied server-side where the backend can.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilter {
    /// Exclude records whose stored playbook score is below this.
    pub min_score: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct BackendStats {
    pub count: usize,
    pub backend: &'static str,
}

/// A vector index: stores embeddings keyed by record id and answers
/// nearest-neighbor queries.
///
/// Results come back ordered by similarity descending, ties broken by
/// record recency (newer first).  Indexing the same id again overwrites the
/// previous point.  Implementations must support concurrent reads.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upsert points, returning how many were indexed.
    async fn index(&self, points: Vec<IndexPoint>) -> Result<usize, RetrievalError>;

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<Hit>, RetrievalError>;

    /// Evict points by record id, for archived records.  Unknown ids are
    /// ignored.
    async fn remove(&self, ids: &[String]) -> Result<(), RetrievalError>;

    /// Drop every point whose record id is not in `keep`.  Runs after a
    /// rebuild so stale points do not outlive the records they indexed.
    async fn retain(&self, keep: &[String]) -> Result<(), RetrievalError>;

    async fn stats(&self) -> Result<BackendStats, RetrievalError>;

    async fn health_check(&self) -> Result<(), RetrievalError>;
}
