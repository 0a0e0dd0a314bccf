use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::{BackendStats, Hit, IndexPoint, SearchFilter, VectorBackend};
use crate::errors::RetrievalError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    vector: Vec<f32>,
    score: i64,
    created_at: DateTime<Utc>,
}

/// In-process vector index with an exhaustive cosine scan.
///
/// The whole index lives in memory and is mirrored to a JSON file under the
/// store's data directory (atomic temp + rename write), so it survives
/// restarts without any network dependency.  Linear scan is fine at
/// playbook scale; this backend exists to keep semantic search working when
/// the remote service is down, not to compete with it.
pub struct LocalBackend {
    path: PathBuf,
    points: RwLock<HashMap<String, StoredPoint>>,
}

impl LocalBackend {
    /// Open the index at `path`, loading persisted points when the file
    /// exists.  An unreadable file starts the index empty rather than
    /// failing; the next persist rewrites it.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let points = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, StoredPoint>>(&raw) {
                Ok(points) => {
                    info!(path = %path.display(), points = points.len(), "local index loaded");
                    points
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "local index unreadable — starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            points: RwLock::new(points),
        }
    }

    async fn persist(&self) -> Result<(), RetrievalError> {
        let rendered = {
            let points = self.points.read().await;
            serde_json::to_string(&*points)
                .map_err(|e| RetrievalError::backend("local", e.to_string()))?
        };

        let io_err = |e: std::io::Error| RetrievalError::backend("local", e.to_string());
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let write_result: Result<(), std::io::Error> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(rendered.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_err(err));
        }
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn index(&self, incoming: Vec<IndexPoint>) -> Result<usize, RetrievalError> {
        let count = incoming.len();
        {
            let mut points = self.points.write().await;
            for point in incoming {
                points.insert(
                    point.id,
                    StoredPoint {
                        vector: point.vector,
                        score: point.score,
                        created_at: point.created_at,
                    },
                );
            }
        }
        self.persist().await?;
        debug!(indexed = count, "local index updated");
        Ok(count)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<Hit>, RetrievalError> {
        let points = self.points.read().await;
        let mut scored: Vec<(f32, DateTime<Utc>, &String)> = points
            .iter()
            .filter(|(_, p)| filter.min_score.is_none_or(|min| p.score >= min))
            .map(|(id, p)| (cosine_similarity(query, &p.vector), p.created_at, id))
            .collect();

        scored.sort_by(|(ls, lt, _), (rs, rt, _)| {
            rs.total_cmp(ls).then_with(|| rt.cmp(lt))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, _, id)| Hit {
                id: id.clone(),
                similarity,
            })
            .collect())
    }

    async fn remove(&self, ids: &[String]) -> Result<(), RetrievalError> {
        {
            let mut points = self.points.write().await;
            for id in ids {
                points.remove(id);
            }
        }
        self.persist().await
    }

    async fn retain(&self, keep: &[String]) -> Result<(), RetrievalError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let dropped = {
            let mut points = self.points.write().await;
            let before = points.len();
            points.retain(|id, _| keep.contains(id.as_str()));
            before - points.len()
        };
        if dropped == 0 {
            return Ok(());
        }
        self.persist().await?;
        debug!(dropped, "local index pruned");
        Ok(())
    }

    async fn stats(&self) -> Result<BackendStats, RetrievalError> {
        Ok(BackendStats {
            count: self.points.read().await.len(),
            backend: self.name(),
        })
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        // No service to reach; healthy as long as the data directory is
        // writable.
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RetrievalError::backend("local", e.to_string()))?;
        }
        Ok(())
    }
}

/// Cosine similarity clamped to [0, 1]; zero when either vector has zero
/// magnitude or the dimensions disagree.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::{LocalBackend, cosine_similarity};
    use crate::backend::{IndexPoint, SearchFilter, VectorBackend};

    fn point(id: &str, vector: Vec<f32>, score: i64, age_hours: i64) -> IndexPoint {
        IndexPoint {
            id: id.to_string(),
            vector,
            score,
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    async fn backend(dir: &TempDir) -> LocalBackend {
        LocalBackend::open(dir.path().join("vector_index.json")).await
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![
                point("stg_001", vec![1.0, 0.0, 0.0], 0, 1),
                point("stg_002", vec![0.7, 0.7, 0.0], 0, 1),
                point("stg_003", vec![0.0, 0.0, 1.0], 0, 1),
            ])
            .await
            .unwrap();

        let hits = backend
            .search(&[1.0, 0.0, 0.0], 3, SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["stg_001", "stg_002", "stg_003"]);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[tokio::test]
    async fn similarity_ties_break_newer_first() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![
                point("stg_old", vec![1.0, 0.0], 0, 48),
                point("stg_new", vec![1.0, 0.0], 0, 1),
            ])
            .await
            .unwrap();

        let hits = backend
            .search(&[1.0, 0.0], 2, SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "stg_new");
        assert_eq!(hits[1].id, "stg_old");
    }

    #[tokio::test]
    async fn min_score_filter_excludes_low_scored_points() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![
                point("stg_high", vec![1.0, 0.0], 5, 1),
                point("stg_low", vec![1.0, 0.0], -2, 1),
            ])
            .await
            .unwrap();

        let hits = backend
            .search(
                &[1.0, 0.0],
                10,
                SearchFilter { min_score: Some(0) },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "stg_high");
    }

    #[tokio::test]
    async fn reindexing_same_id_overwrites() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![point("stg_001", vec![1.0, 0.0], 0, 1)])
            .await
            .unwrap();
        backend
            .index(vec![point("stg_001", vec![0.0, 1.0], 3, 1)])
            .await
            .unwrap();

        assert_eq!(backend.stats().await.unwrap().count, 1);
        let hits = backend
            .search(&[0.0, 1.0], 1, SearchFilter::default())
            .await
            .unwrap();
        assert!(hits[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn remove_evicts_points_and_ignores_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![
                point("stg_001", vec![1.0, 0.0], 0, 1),
                point("stg_002", vec![0.0, 1.0], 0, 1),
            ])
            .await
            .unwrap();

        backend
            .remove(&["stg_001".to_string(), "stg_999".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.stats().await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn retain_drops_points_outside_keep_set() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).await;
        backend
            .index(vec![
                point("stg_001", vec![1.0, 0.0], 0, 1),
                point("stg_002", vec![0.0, 1.0], 0, 1),
                point("stg_003", vec![0.7, 0.7], 0, 1),
            ])
            .await
            .unwrap();

        backend
            .retain(&["stg_001".to_string(), "stg_003".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.stats().await.unwrap().count, 2);
        let hits = backend
            .search(&[0.0, 1.0], 3, SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.id != "stg_002"));
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector_index.json");
        {
            let backend = LocalBackend::open(&path).await;
            backend
                .index(vec![point("stg_001", vec![1.0, 0.0], 2, 1)])
                .await
                .unwrap();
        }

        let reopened = LocalBackend::open(&path).await;
        assert_eq!(reopened.stats().await.unwrap().count, 1);
        let hits = reopened
            .search(&[1.0, 0.0], 1, SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "stg_001");
    }

    #[tokio::test]
    async fn corrupt_index_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector_index.json");
        tokio::fs::write(&path, "{not valid json").await.unwrap();

        let backend = LocalBackend::open(&path).await;
        assert_eq!(backend.stats().await.unwrap().count, 0);
    }
}
