use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gambit_config::EmbeddingConfig;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::errors::RetrievalError;
use crate::retry::RetryPolicy;

/// Seam for turning text into vectors, so the coordinator can be exercised
/// with a deterministic embedder in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;

    /// Embed many texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// Reachability and model availability, without doing embedding work.
    async fn health_check(&self) -> Result<(), RetrievalError>;
}

/// Client for an Ollama-compatible embedding API.
///
/// `POST {base_url}/api/embeddings` with `{"model", "prompt"}` per text;
/// `GET {base_url}/api/tags` for the health check.  Batches are issued in
/// waves of `batch_size` with a semaphore capping concurrent in-flight
/// requests, and every request goes through the retry policy.  Excess
/// requests queue on the semaphore rather than fail.
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    batch_size: usize,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            retry: RetryPolicy::new(config.max_retry_attempts, config.backoff_ms),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = json!({ "model": self.model, "prompt": text });

        // Held across the retry sequence so a flapping service does not see
        // more than `max_concurrent_requests` sockets from us.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RetrievalError::embedding("embedding client shut down"))?;

        self.retry
            .run("embedding request", || {
                let client = self.client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| RetrievalError::embedding(e.to_string()))?;
                    if !resp.status().is_success() {
                        return Err(RetrievalError::embedding(format!(
                            "embedding endpoint returned {}",
                            resp.status()
                        )));
                    }
                    let payload: serde_json::Value = resp
                        .json()
                        .await
                        .map_err(|e| RetrievalError::embedding(e.to_string()))?;
                    parse_embedding(&payload)
                }
            })
            .await
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.embed_one(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for wave in texts.chunks(self.batch_size) {
            let futures = wave.iter().map(|text| self.embed_one(text));
            // try_join_all preserves input order, so vectors line up with
            // texts even though the wave runs concurrently.
            let wave_vectors = futures::future::try_join_all(futures).await?;
            vectors.extend(wave_vectors);
        }

        debug!(texts = texts.len(), "batch embedded");
        Ok(vectors)
    }

    async fn health_check(&self) -> Result<(), RetrievalError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RetrievalError::embedding(format!("cannot reach {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(RetrievalError::embedding(format!(
                "tags endpoint returned {}",
                resp.status()
            )));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RetrievalError::embedding(e.to_string()))?;
        if !model_listed(&payload, &self.model) {
            return Err(RetrievalError::embedding(format!(
                "model {} not found in service listing",
                self.model
            )));
        }
        Ok(())
    }
}

/// Pull the vector out of an `/api/embeddings` response body.
fn parse_embedding(payload: &serde_json::Value) -> Result<Vec<f32>, RetrievalError> {
    let vector: Vec<f32> = payload["embedding"]
        .as_array()
        .ok_or_else(|| RetrievalError::embedding("response has no embedding array"))?
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    if vector.is_empty() {
        return Err(RetrievalError::embedding("embedding array is empty"));
    }
    Ok(vector)
}

/// Whether `model` appears in an `/api/tags` listing.
fn model_listed(payload: &serde_json::Value, model: &str) -> bool {
    payload["models"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m["name"].as_str())
                .any(|name| name == model)
        })
        .unwrap_or(false)
}
