use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, Range, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
    value::Kind,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{BackendStats, Hit, IndexPoint, SearchFilter, VectorBackend};
use crate::errors::RetrievalError;
use crate::retry::RetryPolicy;

/// Remote-service-backed vector index on Qdrant.
///
/// Point ids are UUIDv5 digests of the record id, so re-indexing a record
/// overwrites its point instead of accumulating duplicates.  Record id,
/// score and creation time ride in the payload; the score filter is applied
/// server-side as a range condition.  Every call goes through the same
/// retry/backoff discipline as the embedding client.
pub struct QdrantBackend {
    client: Qdrant,
    collection: String,
    vector_size: u64,
    retry: RetryPolicy,
}

impl QdrantBackend {
    pub fn new(
        url: &str,
        collection: impl Into<String>,
        vector_size: u64,
        retry: RetryPolicy,
    ) -> Result<Self, RetrievalError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| RetrievalError::backend("qdrant", e.to_string()))?;
        Ok(Self {
            client,
            collection: collection.into(),
            vector_size,
            retry,
        })
    }

    fn err(e: impl std::fmt::Display) -> RetrievalError {
        RetrievalError::backend("qdrant", e.to_string())
    }

    fn point_id(record_id: &str) -> PointId {
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, record_id.as_bytes())
            .to_string()
            .into()
    }

    async fn ensure_collection(&self) -> Result<(), RetrievalError> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(Self::err)?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.vector_size, Distance::Cosine),
                    ),
                )
                .await
                .map_err(Self::err)?;
            info!(collection = %self.collection, "qdrant collection created");
        }
        Ok(())
    }

    fn to_point(&self, point: &IndexPoint) -> PointStruct {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("record_id".to_string(), point.id.clone().into());
        payload.insert("score".to_string(), point.score.into());
        payload.insert("created_at".to_string(), point.created_at.timestamp().into());
        PointStruct::new(Self::point_id(&point.id), point.vector.clone(), payload)
    }
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_int(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::IntegerValue(i) => Some(*i),
        _ => None,
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn index(&self, points: Vec<IndexPoint>) -> Result<usize, RetrievalError> {
        if points.is_empty() {
            return Ok(0);
        }
        self.ensure_collection().await?;

        let count = points.len();
        let qdrant_points: Vec<PointStruct> = points.iter().map(|p| self.to_point(p)).collect();
        self.retry
            .run("qdrant upsert", || {
                let request =
                    UpsertPointsBuilder::new(&self.collection, qdrant_points.clone());
                async move { self.client.upsert_points(request).await.map_err(Self::err) }
            })
            .await?;

        debug!(indexed = count, collection = %self.collection, "qdrant index updated");
        Ok(count)
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: SearchFilter,
    ) -> Result<Vec<Hit>, RetrievalError> {
        let response = self
            .retry
            .run("qdrant search", || {
                let mut request =
                    SearchPointsBuilder::new(&self.collection, query.to_vec(), k as u64)
                        .with_payload(true);
                if let Some(min_score) = filter.min_score {
                    request = request.filter(Filter::must([Condition::range(
                        "score",
                        Range {
                            gte: Some(min_score as f64),
                            ..Default::default()
                        },
                    )]));
                }
                async move { self.client.search_points(request).await.map_err(Self::err) }
            })
            .await?;

        // Qdrant orders by similarity only; apply the recency tie-break
        // from the payload timestamps.
        let mut scored: Vec<(f32, i64, String)> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = payload_str(&point.payload, "record_id")?;
                let created_at = payload_int(&point.payload, "created_at").unwrap_or(0);
                Some((point.score, created_at, id))
            })
            .collect();
        scored.sort_by(|(ls, lt, _), (rs, rt, _)| rs.total_cmp(ls).then_with(|| rt.cmp(lt)));

        Ok(scored
            .into_iter()
            .map(|(similarity, _, id)| Hit { id, similarity })
            .collect())
    }

    async fn remove(&self, ids: &[String]) -> Result<(), RetrievalError> {
        if ids.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|id| Self::point_id(id)).collect();
        self.retry
            .run("qdrant delete", || {
                let request =
                    DeletePointsBuilder::new(&self.collection).points(point_ids.clone());
                async move { self.client.delete_points(request).await.map_err(Self::err) }
            })
            .await?;
        Ok(())
    }

    async fn retain(&self, keep: &[String]) -> Result<(), RetrievalError> {
        self.ensure_collection().await?;
        // Server-side filter delete: everything whose record_id payload is
        // not in the keep set goes in one call.
        let keep: Vec<String> = keep.to_vec();
        self.retry
            .run("qdrant prune", || {
                let filter =
                    Filter::must_not([Condition::matches("record_id", keep.clone())]);
                let request = DeletePointsBuilder::new(&self.collection).points(filter);
                async move { self.client.delete_points(request).await.map_err(Self::err) }
            })
            .await?;
        debug!(collection = %self.collection, "qdrant index pruned");
        Ok(())
    }

    async fn stats(&self) -> Result<BackendStats, RetrievalError> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(Self::err)?;
        let count = info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize;
        Ok(BackendStats {
            count,
            backend: self.name(),
        })
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        self.client.health_check().await.map_err(Self::err)?;
        self.ensure_collection().await
    }
}
