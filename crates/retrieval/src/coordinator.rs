use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gambit_config::GambitConfig;
use gambit_store::StrategyRecord;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendStats, IndexPoint, SearchFilter, VectorBackend};
use crate::embedding::{Embedder, EmbeddingClient};
use crate::local::LocalBackend;
#[cfg(feature = "qdrant")]
use crate::qdrant::QdrantBackend;
#[cfg(feature = "qdrant")]
use crate::retry::RetryPolicy;

/// Where searches are currently served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Not yet probed; resolved lazily on first use.
    Probing,
    RemoteActive,
    LocalActive,
    /// No semantic backend usable; score-ranked fallback serves searches.
    Disabled,
}

impl BackendState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Probing => "probing",
            Self::RemoteActive => "remote-active",
            Self::LocalActive => "local-active",
            Self::Disabled => "disabled",
        }
    }
}

/// Backend selection policy from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preference {
    Auto,
    Remote,
    Local,
    None,
}

impl Preference {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" => Self::Remote,
            "local" => Self::Local,
            "none" => Self::None,
            "auto" => Self::Auto,
            other => {
                debug!(backend = other, "unknown backend preference — treating as auto");
                Self::Auto
            }
        }
    }

    fn allows_remote(self) -> bool {
        matches!(self, Self::Auto | Self::Remote)
    }

    fn allows_local(self) -> bool {
        matches!(self, Self::Auto | Self::Local)
    }
}

/// One search result as handed to collaborators.
#[derive(Debug, Clone)]
pub struct RankedStrategy {
    pub id: String,
    pub text: String,
    pub score: i64,
    /// Cosine similarity in [0, 1] on the semantic path; `None` on the
    /// score-ranked fallback.
    pub relevance: Option<f32>,
}

impl RankedStrategy {
    /// Relevance as a whole percentage, for display.
    pub fn relevance_percent(&self) -> Option<u8> {
        self.relevance
            .map(|r| (r.clamp(0.0, 1.0) * 100.0).round() as u8)
    }
}

/// Backend availability for observability.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub state: &'static str,
    pub backend: Option<BackendStats>,
}

/// Selects an available backend at runtime, mediates indexing and search,
/// and falls back to deterministic score ranking when no backend is usable.
///
/// Availability is a small state machine ([`BackendState`]) evaluated
/// lazily: on first use, and re-probed at the next indexing trigger after a
/// failure dropped the coordinator to `Disabled`.  Retrieval-path errors
/// never escape this type — they only change which state it is in.
pub struct RetrievalCoordinator {
    config: GambitConfig,
    embedder: Arc<dyn Embedder>,
    remote: Option<Arc<dyn VectorBackend>>,
    local: Option<Arc<dyn VectorBackend>>,
    state: Arc<RwLock<BackendState>>,
    reindex_generation: Arc<AtomicU64>,
    reindex_task: Mutex<Option<JoinHandle<()>>>,
}

impl RetrievalCoordinator {
    /// Wire the coordinator with explicit seams.  Tests inject mock
    /// embedders and backends here; applications normally use
    /// [`RetrievalCoordinator::from_config`].
    pub fn new(
        config: GambitConfig,
        embedder: Arc<dyn Embedder>,
        remote: Option<Arc<dyn VectorBackend>>,
        local: Option<Arc<dyn VectorBackend>>,
    ) -> Self {
        Self {
            config,
            embedder,
            remote,
            local,
            state: Arc::new(RwLock::new(BackendState::Probing)),
            reindex_generation: Arc::new(AtomicU64::new(0)),
            reindex_task: Mutex::new(None),
        }
    }

    /// Build the production wiring: Ollama embedding client, Qdrant remote
    /// backend (when the `qdrant` feature is on), local on-disk fallback.
    pub async fn from_config(config: GambitConfig) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(&config.embedding));

        #[cfg(feature = "qdrant")]
        let remote: Option<Arc<dyn VectorBackend>> = match QdrantBackend::new(
            &config.retrieval.qdrant_url,
            config.retrieval.collection_name.clone(),
            config.embedding.vector_size,
            RetryPolicy::new(config.embedding.max_retry_attempts, config.embedding.backoff_ms),
        ) {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                warn!(error = %err, "qdrant client unavailable — remote backend disabled");
                None
            }
        };
        #[cfg(not(feature = "qdrant"))]
        let remote: Option<Arc<dyn VectorBackend>> = None;

        let local: Arc<dyn VectorBackend> =
            Arc::new(LocalBackend::open(config.local_index_path()).await);

        Self::new(config, embedder, remote, Some(local))
    }

    // ── Availability state machine ─────────────────────────────────────────

    /// Probe embedding service and backends in preference order and store
    /// the resulting state.
    async fn probe(&self) -> BackendState {
        let preference = Preference::parse(&self.config.retrieval.backend);
        let next = self.probe_with(preference).await;
        info!(state = next.as_str(), "backend probe complete");
        *self.state.write().await = next;
        next
    }

    async fn probe_with(&self, preference: Preference) -> BackendState {
        if preference == Preference::None {
            return BackendState::Disabled;
        }

        // Both backends consume vectors, so an unreachable embedding
        // service short-circuits the whole semantic path.
        if let Err(err) = self.embedder.health_check().await {
            warn!(error = %err, "embedding service unavailable — semantic path disabled");
            return BackendState::Disabled;
        }

        if preference.allows_remote() {
            if let Some(remote) = &self.remote {
                match remote.health_check().await {
                    Ok(()) => return BackendState::RemoteActive,
                    Err(err) => {
                        warn!(backend = remote.name(), error = %err, "remote backend probe failed");
                    }
                }
            }
        }

        if preference.allows_local() {
            if let Some(local) = &self.local {
                match local.health_check().await {
                    Ok(()) => return BackendState::LocalActive,
                    Err(err) => {
                        warn!(backend = local.name(), error = %err, "local backend probe failed");
                    }
                }
            }
        }

        BackendState::Disabled
    }

    /// Current state, probing first if it was never resolved.
    async fn ensure_probed(&self) -> BackendState {
        let current = *self.state.read().await;
        if current == BackendState::Probing {
            self.probe().await
        } else {
            current
        }
    }

    fn backend_for(&self, state: BackendState) -> Option<Arc<dyn VectorBackend>> {
        match state {
            BackendState::RemoteActive => self.remote.clone(),
            BackendState::LocalActive => self.local.clone(),
            BackendState::Probing | BackendState::Disabled => None,
        }
    }

    async fn disable(&self, why: &str) {
        warn!(why, "semantic path disabled — falling back to score ranking");
        *self.state.write().await = BackendState::Disabled;
    }

    // ── Search ─────────────────────────────────────────────────────────────

    /// Rank `active_records` against `query`.
    ///
    /// Never fails: when the semantic path is unavailable the records come
    /// back ordered by stored score descending (ties: earlier `created_at`
    /// first) with no relevance attached, and an empty collection yields an
    /// empty list.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        active_records: &[StrategyRecord],
    ) -> Vec<RankedStrategy> {
        self.search_with_filter(query, limit, SearchFilter::default(), active_records)
            .await
    }

    /// [`RetrievalCoordinator::search`] with a stored-score floor, applied
    /// on both the semantic path and the fallback.  A zero `limit` means
    /// the configured `search_result_limit`.
    #[instrument(skip(self, active_records), fields(records = active_records.len()))]
    pub async fn search_with_filter(
        &self,
        query: &str,
        limit: usize,
        filter: SearchFilter,
        active_records: &[StrategyRecord],
    ) -> Vec<RankedStrategy> {
        if active_records.is_empty() {
            return Vec::new();
        }
        let limit = if limit == 0 {
            self.config.retrieval.search_result_limit
        } else {
            limit
        };

        // Below the index-size gate no build ever ran; score ranking is
        // cheaper and equally effective at this corpus size, so serve it
        // directly instead of querying an empty index.
        if active_records.len() < self.config.retrieval.min_strategies_for_index {
            return fallback_ranking(active_records, limit, filter);
        }

        let state = self.ensure_probed().await;
        let Some(backend) = self.backend_for(state) else {
            return fallback_ranking(active_records, limit, filter);
        };

        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                self.disable(&err.to_string()).await;
                return fallback_ranking(active_records, limit, filter);
            }
        };

        let hits = match backend.search(&query_vector, limit, filter).await {
            Ok(hits) => hits,
            Err(err) => {
                self.disable(&err.to_string()).await;
                return fallback_ranking(active_records, limit, filter);
            }
        };

        // An index with nothing to offer (not yet built, or emptied by a
        // prune) must not turn into an empty result while active records
        // exist; the caller is owed a ranked list either way.
        if hits.is_empty() {
            return fallback_ranking(active_records, limit, filter);
        }

        let by_id: HashMap<&str, &StrategyRecord> = active_records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| (r.id.as_str(), r))
            .collect();

        let threshold = self.config.retrieval.similarity_threshold;
        hits.into_iter()
            .filter(|hit| hit.similarity >= threshold)
            // The index can momentarily hold archived or stale ids; only
            // records the caller knows as active make it out.
            .filter_map(|hit| {
                by_id.get(hit.id.as_str()).map(|record| RankedStrategy {
                    id: record.id.clone(),
                    text: record.text.clone(),
                    score: record.score,
                    relevance: Some(hit.similarity.clamp(0.0, 1.0)),
                })
            })
            .take(limit)
            .collect()
    }

    // ── Indexing ───────────────────────────────────────────────────────────

    /// Rebuild the index for the current active records, as a background
    /// task.  A newer call supersedes an in-flight build rather than racing
    /// it.  Also the recovery point: a `Disabled` coordinator re-probes
    /// here.
    #[instrument(skip(self, active_records), fields(records = active_records.len()))]
    pub async fn reindex(&self, active_records: Vec<StrategyRecord>) {
        let mut state = *self.state.read().await;
        if state == BackendState::Probing || state == BackendState::Disabled {
            state = self.probe().await;
        }
        let Some(backend) = self.backend_for(state) else {
            return;
        };

        if active_records.len() < self.config.retrieval.min_strategies_for_index {
            debug!(
                records = active_records.len(),
                min = self.config.retrieval.min_strategies_for_index,
                "below corpus gate — skipping index build"
            );
            return;
        }

        let generation = self.reindex_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation_counter = Arc::clone(&self.reindex_generation);
        let embedder = Arc::clone(&self.embedder);
        let state_slot = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            let texts: Vec<String> = active_records.iter().map(|r| r.text.clone()).collect();
            let vectors = match embedder.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(err) => {
                    if generation_counter.load(Ordering::SeqCst) == generation {
                        warn!(error = %err, "index build failed at embedding — disabling");
                        *state_slot.write().await = BackendState::Disabled;
                    }
                    return;
                }
            };

            // A newer delta landed while we were embedding; its build owns
            // the index now.
            if generation_counter.load(Ordering::SeqCst) != generation {
                debug!(generation, "index build superseded — dropping");
                return;
            }

            let points: Vec<IndexPoint> = active_records
                .iter()
                .zip(vectors)
                .map(|(record, vector)| IndexPoint {
                    id: record.id.clone(),
                    vector,
                    score: record.score,
                    created_at: record.created_at,
                })
                .collect();
            let keep: Vec<String> = active_records.iter().map(|r| r.id.clone()).collect();

            match backend.index(points).await {
                Ok(count) => {
                    // A rebuild replaces the corpus: points for records no
                    // longer in it are stale and must not keep surfacing.
                    if generation_counter.load(Ordering::SeqCst) == generation {
                        if let Err(err) = backend.retain(&keep).await {
                            warn!(error = %err, "stale point prune failed");
                        }
                    }
                    info!(indexed = count, backend = backend.name(), "index rebuilt");
                }
                Err(err) => {
                    if generation_counter.load(Ordering::SeqCst) == generation {
                        warn!(error = %err, "index build failed at backend — disabling");
                        *state_slot.write().await = BackendState::Disabled;
                    }
                }
            }
        });

        let previous = self.reindex_task.lock().await.replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Evict archived records from the live index.  Failures are absorbed;
    /// the next search or reindex sorts the state out.
    pub async fn remove(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let state = *self.state.read().await;
        if let Some(backend) = self.backend_for(state) {
            if let Err(err) = backend.remove(ids).await {
                warn!(error = %err, "index eviction failed");
            }
        }
    }

    /// Wait for an in-flight index build, if any.  Used at shutdown so a
    /// build is not torn down mid-write, and by tests for determinism.
    pub async fn wait_for_reindex(&self) {
        let handle = self.reindex_task.lock().await.take();
        if let Some(handle) = handle {
            // Aborted (superseded) builds land here as JoinErrors; both
            // outcomes mean no build is in flight any more.
            let _ = handle.await;
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = *self.state.read().await;
        let backend = match self.backend_for(state) {
            Some(backend) => backend.stats().await.ok(),
            None => None,
        };
        CoordinatorStatus {
            state: state.as_str(),
            backend,
        }
    }
}

/// Deterministic ranking used whenever no semantic backend is usable:
/// stored score descending, earlier `created_at` first on ties.
fn fallback_ranking(
    records: &[StrategyRecord],
    limit: usize,
    filter: SearchFilter,
) -> Vec<RankedStrategy> {
    let mut ranked: Vec<&StrategyRecord> = records
        .iter()
        .filter(|r| r.is_active())
        .filter(|r| filter.min_score.is_none_or(|min| r.score >= min))
        .collect();
    ranked.sort_by(|l, r| {
        r.score
            .cmp(&l.score)
            .then_with(|| l.created_at.cmp(&r.created_at))
    });

    ranked
        .into_iter()
        .take(limit)
        .map(|record| RankedStrategy {
            id: record.id.clone(),
            text: record.text.clone(),
            score: record.score,
            relevance: None,
        })
        .collect()
}
