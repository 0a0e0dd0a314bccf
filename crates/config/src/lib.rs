use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Store config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `playbook.json`, `playbook_history.jsonl` and the
    /// local vector index.  Overridden at runtime by the `GAMBIT_DATA_DIR`
    /// environment variable when set.
    pub data_dir: String,
    /// Active records at or below this score are eligible for the
    /// score-threshold archival sweep.
    pub archive_threshold: i64,
    /// Normalized text similarity at or above which a proposed addition is
    /// treated as a duplicate of an existing active record.
    pub duplicate_similarity_threshold: f64,
    /// Score delta applied for a `helpful` evaluation outcome.
    pub helpful_delta: i64,
    /// Score delta applied for a `neutral` evaluation outcome.
    pub neutral_delta: i64,
    /// Score delta applied for a `harmful` evaluation outcome.
    pub harmful_delta: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: ".gambit".to_string(),
            archive_threshold: -5,
            duplicate_similarity_threshold: 0.85,
            helpful_delta: 1,
            neutral_delta: -1,
            harmful_delta: -3,
        }
    }
}

// ── Embedding config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Base URL for the Ollama-compatible embedding API.  Overridden at
    /// runtime by the `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    /// Dimension of the vectors the model produces.
    pub vector_size: u64,
    /// Texts per request wave when batch-embedding.
    pub batch_size: usize,
    /// Maximum simultaneous in-flight embedding requests.
    pub max_concurrent_requests: usize,
    /// Attempts per request before the embedding path is declared
    /// unavailable.
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff between retries.
    pub backoff_ms: u64,
    /// Hard per-request timeout.
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3-embedding:0.6b".to_string(),
            vector_size: 768,
            batch_size: 10,
            max_concurrent_requests: 4,
            max_retry_attempts: 3,
            backoff_ms: 100,
            request_timeout_secs: 30,
        }
    }
}

// ── Retrieval config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Backend selection policy.  Recognised values: `auto` (probe remote,
    /// then local), `remote`, `local`, `none`.  Overridden at runtime by the
    /// `GAMBIT_BACKEND` environment variable when set.
    pub backend: String,
    /// Qdrant endpoint.  Overridden at runtime by the `QDRANT_URL`
    /// environment variable when set.
    pub qdrant_url: String,
    pub collection_name: String,
    /// Below this many active records no vector index is built; score
    /// ranking serves searches instead.
    pub min_strategies_for_index: usize,
    /// Default result count for searches.
    pub search_result_limit: usize,
    /// Semantic hits with similarity below this are dropped from results.
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            qdrant_url: "http://localhost:6334".to_string(),
            collection_name: "playbook_strategies".to_string(),
            min_strategies_for_index: 10,
            search_result_limit: 10,
            similarity_threshold: 0.30,
        }
    }
}

// ── Top-level config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GambitConfig {
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

impl GambitConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("GAMBIT_DATA_DIR") {
            if !value.is_empty() {
                config.store.data_dir = value;
            }
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.embedding.base_url = value;
            }
        }

        if let Ok(value) = env::var("QDRANT_URL") {
            if !value.is_empty() {
                config.retrieval.qdrant_url = value;
            }
        }

        if let Ok(value) = env::var("GAMBIT_BACKEND") {
            if !value.is_empty() {
                config.retrieval.backend = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn playbook_path(&self) -> PathBuf {
        Path::new(&self.store.data_dir).join("playbook.json")
    }

    pub fn history_path(&self) -> PathBuf {
        Path::new(&self.store.data_dir).join("playbook_history.jsonl")
    }

    pub fn local_index_path(&self) -> PathBuf {
        Path::new(&self.store.data_dir).join("vector_index.json")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
