use std::path::PathBuf;

use chrono::{DateTime, Utc};
use gambit_config::GambitConfig;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::collection::Collection;
use crate::dedupe;
use crate::delta::{AppliedOp, Delta, DeltaOp, UpdateChange};
use crate::errors::StoreError;
use crate::history::{HistoryEntry, HistoryLog};
use crate::schema::{Evaluation, Outcome, StrategyRecord, StrategyStatus};

/// What a successfully applied delta did: the new collection version and the
/// ids each kind of operation touched.  A suppressed duplicate `Add` shows up
/// under `updated`, not `added`.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub version: u64,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub archived: Vec<String>,
}

/// Collection-level counters for observability.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub version: u64,
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub mean_score: f64,
    pub last_updated: DateTime<Utc>,
}

/// The knowledge store: sole owner of the strategy collection and its audit
/// history.
///
/// Delta application is serialized through a writer mutex so the version
/// counter advances by exactly 1 per applied delta.  Reads clone out of a
/// `RwLock` and never wait on an in-flight apply beyond the final swap.
/// All mutation goes through [`Store::apply_delta`]; nothing edits the
/// collection out of band.
pub struct Store {
    config: GambitConfig,
    playbook_path: PathBuf,
    history: HistoryLog,
    collection: RwLock<Collection>,
    writer: Mutex<()>,
}

impl Store {
    /// Open the store under `config.store.data_dir`, loading the persisted
    /// snapshot when one exists.
    pub async fn open(config: GambitConfig) -> Result<Self, StoreError> {
        let playbook_path = config.playbook_path();
        let history = HistoryLog::new(config.history_path());

        if let Some(parent) = playbook_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let collection = if playbook_path.exists() {
            let raw = tokio::fs::read_to_string(&playbook_path).await?;
            let collection: Collection = serde_json::from_str(&raw)?;
            info!(
                path = %playbook_path.display(),
                version = collection.version,
                records = collection.len(),
                "playbook loaded"
            );
            collection
        } else {
            info!(path = %playbook_path.display(), "starting fresh playbook");
            Collection::new()
        };

        Ok(Self {
            config,
            playbook_path,
            history,
            collection: RwLock::new(collection),
            writer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &GambitConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    // ── Delta application ──────────────────────────────────────────────────

    /// Apply an atomic batch of operations.
    ///
    /// `expected_version` is the collection version the caller read before
    /// building the delta; a mismatch yields [`StoreError::Conflict`] and the
    /// caller re-reads and retries.  On success the snapshot and one history
    /// entry are persisted before the in-memory collection is swapped, and
    /// the version has advanced by exactly 1.  On any error nothing is
    /// mutated.
    #[instrument(skip(self, delta), fields(source = %delta.source, ops = delta.ops.len()))]
    pub async fn apply_delta(
        &self,
        expected_version: u64,
        delta: Delta,
    ) -> Result<ApplyOutcome, StoreError> {
        if delta.is_empty() {
            return Err(StoreError::validation("delta has no operations"));
        }

        let _writer = self.writer.lock().await;

        let mut next = self.collection.read().await.clone();
        if next.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: next.version,
            });
        }

        let Delta { source, ops } = delta;
        let now = Utc::now();
        let mut applied: Vec<AppliedOp> = Vec::new();
        let mut outcome = ApplyOutcome::default();

        for op in ops {
            match op {
                DeltaOp::Add { draft } => {
                    let text = draft.text.trim().to_string();
                    if text.is_empty() {
                        return Err(StoreError::validation("strategy text is empty"));
                    }
                    if !(0.0..=1.0).contains(&draft.atomicity) {
                        return Err(StoreError::validation(format!(
                            "atomicity {} outside [0, 1]",
                            draft.atomicity
                        )));
                    }

                    let duplicate = {
                        let active = next.active();
                        dedupe::find_near_duplicate(
                            &text,
                            &active,
                            self.config.store.duplicate_similarity_threshold,
                        )
                        .map(|existing| existing.id.clone())
                    };

                    if let Some(existing_id) = duplicate {
                        debug!(id = %existing_id, "near-duplicate add converted to reinforcement");
                        let record = next.get_mut(&existing_id).ok_or_else(|| {
                            StoreError::validation(format!(
                                "duplicate target {existing_id} vanished mid-apply"
                            ))
                        })?;
                        self.apply_evaluation(record, Outcome::Helpful, None, now);
                        outcome.updated.push(existing_id.clone());
                        applied.push(AppliedOp::Update {
                            id: existing_id,
                            change: UpdateChange::Score {
                                outcome: Outcome::Helpful,
                                note: None,
                            },
                            reason: "duplicate-suppressed".to_string(),
                        });
                        continue;
                    }

                    let id = draft.id.unwrap_or_else(|| next.next_id());
                    let record = StrategyRecord {
                        id: id.clone(),
                        text,
                        score: 0,
                        atomicity: draft.atomicity,
                        status: StrategyStatus::Active,
                        source: source.clone(),
                        evaluations: vec![],
                        created_at: now,
                        archived_at: None,
                        archived_reason: None,
                    };
                    if !next.insert(record) {
                        return Err(StoreError::validation(format!(
                            "add references duplicate id {id}"
                        )));
                    }
                    outcome.added.push(id.clone());
                    applied.push(AppliedOp::Add { id });
                }

                DeltaOp::Update { id, change, reason } => {
                    let record = next.get_mut(&id).ok_or_else(|| {
                        StoreError::validation(format!("update references unknown id {id}"))
                    })?;
                    match &change {
                        UpdateChange::Score { outcome: verdict, note } => {
                            self.apply_evaluation(record, *verdict, note.clone(), now);
                        }
                        UpdateChange::Source { source } => {
                            record.source = source.clone();
                        }
                    }
                    outcome.updated.push(id.clone());
                    applied.push(AppliedOp::Update { id, change, reason });
                }

                DeltaOp::Archive { id, reason } => {
                    let record = next.get_mut(&id).ok_or_else(|| {
                        StoreError::validation(format!("archive references unknown id {id}"))
                    })?;
                    if !record.is_active() {
                        // Re-archival is a legal no-op; the original reason stays.
                        debug!(id = %id, "record already archived — skipping");
                        continue;
                    }
                    record.status = StrategyStatus::Archived;
                    record.archived_at = Some(now);
                    record.archived_reason = Some(reason.clone());
                    debug!(id = %id, status = record.status.as_str(), reason = %reason, "record archived");
                    outcome.archived.push(id.clone());
                    applied.push(AppliedOp::Archive { id, reason });
                }
            }
        }

        next.version += 1;
        next.last_updated = now;

        let entry = HistoryEntry {
            timestamp: now,
            source,
            version: next.version,
            ops: applied,
            active_count: next.active_count(),
            mean_score: next.mean_score(),
        };

        self.persist_snapshot(&next).await?;
        self.history.append(&entry).await?;

        outcome.version = next.version;
        *self.collection.write().await = next;

        info!(
            version = outcome.version,
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            archived = outcome.archived.len(),
            "delta applied"
        );
        Ok(outcome)
    }

    fn score_delta(&self, outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Helpful => self.config.store.helpful_delta,
            Outcome::Neutral => self.config.store.neutral_delta,
            Outcome::Harmful => self.config.store.harmful_delta,
        }
    }

    fn apply_evaluation(
        &self,
        record: &mut StrategyRecord,
        outcome: Outcome,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        let delta = self.score_delta(outcome);
        record.score += delta;
        record.evaluations.push(Evaluation {
            timestamp: now,
            outcome,
            delta,
            score_after: record.score,
            note,
        });
    }

    // ── Policy delta builders ──────────────────────────────────────────────

    /// Build the low-score archival delta: one `Archive` op with reason
    /// `score-threshold` per active record at or below the configured
    /// threshold.  Returns the version the collection was read at; the
    /// caller submits the delta through [`Store::apply_delta`] (and skips
    /// the call when it is empty).
    pub async fn cleanup_delta(&self, source: impl Into<String>) -> (u64, Delta) {
        let collection = self.collection.read().await;
        let mut delta = Delta::new(source);
        for record in collection.active() {
            if record.score <= self.config.store.archive_threshold {
                delta.push(DeltaOp::Archive {
                    id: record.id.clone(),
                    reason: "score-threshold".to_string(),
                });
            }
        }
        (collection.version, delta)
    }

    /// Build a duplicate-sweep delta over active records: for each pair with
    /// text similarity at or above `threshold` the lower-scored member is
    /// archived with reason `duplicate of <kept id>`.  The sweep threshold
    /// is a parameter because sweeps typically run looser than the add-time
    /// suppression check.
    pub async fn dedupe_delta(&self, source: impl Into<String>, threshold: f64) -> (u64, Delta) {
        let collection = self.collection.read().await;
        let active = collection.active();
        let mut delta = Delta::new(source);
        for (lose, keep) in dedupe::sweep(&active, threshold) {
            delta.push(DeltaOp::Archive {
                id: lose,
                reason: format!("duplicate of {keep}"),
            });
        }
        (collection.version, delta)
    }

    // ── Reads ──────────────────────────────────────────────────────────────

    pub async fn version(&self) -> u64 {
        self.collection.read().await.version
    }

    /// Clone of the full collection, for callers that need a consistent view.
    pub async fn snapshot(&self) -> Collection {
        self.collection.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<StrategyRecord> {
        self.collection.read().await.get(id).cloned()
    }

    /// Active records in insertion order, cloned out of the lock.
    pub async fn active_records(&self) -> Vec<StrategyRecord> {
        self.collection
            .read()
            .await
            .active()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let collection = self.collection.read().await;
        let active = collection.active_count();
        StoreStats {
            version: collection.version,
            total: collection.len(),
            active,
            archived: collection.len() - active,
            mean_score: collection.mean_score(),
            last_updated: collection.last_updated,
        }
    }

    // ── Persistence ────────────────────────────────────────────────────────

    /// Atomically replace the playbook snapshot.
    ///
    /// The new content is written to a `.tmp` sibling, fsync'd, then renamed
    /// over the original.  A crash before the rename leaves the old snapshot
    /// untouched; the `.tmp` file is cleaned up on any error path.
    async fn persist_snapshot(&self, collection: &Collection) -> Result<(), StoreError> {
        if let Some(parent) = self.playbook_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .playbook_path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "playbook.json".to_string());
            self.playbook_path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<(), StoreError> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            let rendered = serde_json::to_string_pretty(collection)?;
            file.write_all(rendered.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.playbook_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::Store;
    use crate::delta::{AppliedOp, Delta, DeltaOp, StrategyDraft, UpdateChange};
    use crate::errors::StoreError;
    use crate::schema::{Outcome, StrategyStatus};

    fn test_config(dir: &TempDir) -> gambit_config::GambitConfig {
        let mut cfg = gambit_config::GambitConfig::default();
        cfg.store.data_dir = dir.path().to_string_lossy().to_string();
        cfg
    }

    async fn open_store(dir: &TempDir) -> Store {
        Store::open(test_config(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn add_assigns_sequential_ids() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let delta = Delta::new("reflector")
            .add(StrategyDraft::new("pool DB connections for performance", 0.9))
            .add(StrategyDraft::new("use async for DB calls", 0.8));
        let outcome = store.apply_delta(0, delta).await?;

        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.added, vec!["stg_001", "stg_002"]);
        let record = store.get("stg_001").await.unwrap();
        assert_eq!(record.score, 0);
        assert_eq!(record.status, StrategyStatus::Active);
        assert_eq!(record.source, "reflector");
        Ok(())
    }

    #[tokio::test]
    async fn apply_requires_matching_version() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let delta = Delta::new("test").add(StrategyDraft::new("first strategy", 0.5));
        store.apply_delta(0, delta).await?;

        let stale = Delta::new("test").add(StrategyDraft::new("second strategy", 0.5));
        let err = store.apply_delta(0, stale).await.unwrap_err();
        match err {
            StoreError::Conflict { expected, actual } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn invalid_op_rolls_back_whole_delta() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let delta = Delta::new("test")
            .add(StrategyDraft::new("a perfectly valid strategy", 0.7))
            .evaluate("stg_999", Outcome::Helpful, "no such record");
        let err = store.apply_delta(0, delta).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        assert_eq!(store.version().await, 0);
        assert!(store.active_records().await.is_empty());
        assert!(store.history().load()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn evaluations_accumulate_score() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let add = Delta::new("reflector").add(StrategyDraft::new("retry transient failures", 0.9));
        store.apply_delta(0, add).await?;

        let evals = Delta::new("session-end")
            .evaluate("stg_001", Outcome::Helpful, "fixed the flake")
            .evaluate("stg_001", Outcome::Harmful, "masked a real bug");
        let outcome = store.apply_delta(1, evals).await?;
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.updated, vec!["stg_001", "stg_001"]);

        let record = store.get("stg_001").await.unwrap();
        assert_eq!(record.score, -2);
        assert_eq!(record.evaluations.len(), 2);
        assert_eq!(record.evaluations[0].delta, 1);
        assert_eq!(record.evaluations[0].score_after, 1);
        assert_eq!(record.evaluations[1].delta, -3);
        assert_eq!(record.evaluations[1].score_after, -2);

        // Both mutations are traceable to one history entry.
        let history = store.history().load()?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].ops.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn source_relabel_updates_metadata() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("reflector").add(StrategyDraft::new("prefer explicit timeouts", 0.8)),
            )
            .await?;

        let mut relabel = Delta::new("curator");
        relabel.push(DeltaOp::Update {
            id: "stg_001".to_string(),
            change: UpdateChange::Source {
                source: "curated".to_string(),
            },
            reason: "provenance cleanup".to_string(),
        });
        store.apply_delta(1, relabel).await?;

        assert_eq!(store.get("stg_001").await.unwrap().source, "curated");
        Ok(())
    }

    #[tokio::test]
    async fn archive_sets_metadata_and_leaves_record_in_place() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("test").add(StrategyDraft::new("a strategy to retire", 0.5)),
            )
            .await?;
        let outcome = store
            .apply_delta(1, Delta::new("cleanup").archive("stg_001", "stale"))
            .await?;
        assert_eq!(outcome.archived, vec!["stg_001"]);

        let record = store.get("stg_001").await.unwrap();
        assert_eq!(record.status, StrategyStatus::Archived);
        assert!(record.archived_at.is_some());
        assert_eq!(record.archived_reason.as_deref(), Some("stale"));
        assert!(store.active_records().await.is_empty());
        assert_eq!(store.stats().await.total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn rearchival_is_legal_and_leaves_data_untouched() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(0, Delta::new("test").add(StrategyDraft::new("short-lived idea", 0.5)))
            .await?;
        store
            .apply_delta(1, Delta::new("cleanup").archive("stg_001", "first reason"))
            .await?;
        let first = store.get("stg_001").await.unwrap();

        let outcome = store
            .apply_delta(2, Delta::new("cleanup").archive("stg_001", "second reason"))
            .await?;
        assert_eq!(outcome.version, 3);
        assert!(outcome.archived.is_empty());

        let second = store.get("stg_001").await.unwrap();
        assert_eq!(second.archived_reason, first.archived_reason);
        assert_eq!(second.archived_at, first.archived_at);

        // No duplicate archival op lands in history.
        let history = store.history().load()?;
        assert!(history[2].ops.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_add_reinforces_existing_record() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("reflector")
                    .add(StrategyDraft::new("pool DB connections for performance", 0.9)),
            )
            .await?;

        let dup = Delta::new("reflector")
            .add(StrategyDraft::new("Pool DB connections for performance!", 0.9));
        let outcome = store.apply_delta(1, dup).await?;

        assert!(outcome.added.is_empty());
        assert_eq!(outcome.updated, vec!["stg_001"]);
        assert_eq!(store.stats().await.total, 1);

        let record = store.get("stg_001").await.unwrap();
        assert_eq!(record.score, 1);
        assert_eq!(record.evaluations.len(), 1);
        assert_eq!(record.evaluations[0].outcome, Outcome::Helpful);

        let history = store.history().load()?;
        match &history[1].ops[0] {
            AppliedOp::Update { id, reason, .. } => {
                assert_eq!(id, "stg_001");
                assert_eq!(reason, "duplicate-suppressed");
            }
            other => panic!("expected update op, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_adds_within_one_delta_collapse() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let delta = Delta::new("reflector")
            .add(StrategyDraft::new("always pin dependency versions", 0.8))
            .add(StrategyDraft::new("always pin dependency versions", 0.8));
        let outcome = store.apply_delta(0, delta).await?;

        assert_eq!(outcome.added, vec!["stg_001"]);
        assert_eq!(outcome.updated, vec!["stg_001"]);
        assert_eq!(store.stats().await.total, 1);
        assert_eq!(store.get("stg_001").await.unwrap().score, 1);
        Ok(())
    }

    #[tokio::test]
    async fn archived_records_do_not_suppress_new_adds() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("test").add(StrategyDraft::new("cache expensive lookups", 0.8)),
            )
            .await?;
        store
            .apply_delta(1, Delta::new("cleanup").archive("stg_001", "stale"))
            .await?;

        let outcome = store
            .apply_delta(
                2,
                Delta::new("test").add(StrategyDraft::new("cache expensive lookups", 0.8)),
            )
            .await?;
        assert_eq!(outcome.added, vec!["stg_002"]);
        Ok(())
    }

    #[tokio::test]
    async fn explicit_duplicate_id_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("test")
                    .add(StrategyDraft::new("first strategy", 0.5).with_id("custom-1")),
            )
            .await?;
        let err = store
            .apply_delta(
                1,
                Delta::new("test")
                    .add(StrategyDraft::new("entirely different text", 0.5).with_id("custom-1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn empty_text_and_bad_atomicity_are_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let blank = Delta::new("test").add(StrategyDraft::new("   ", 0.5));
        assert!(matches!(
            store.apply_delta(0, blank).await.unwrap_err(),
            StoreError::Validation { .. }
        ));

        let out_of_range = Delta::new("test").add(StrategyDraft::new("fine text", 1.5));
        assert!(matches!(
            store.apply_delta(0, out_of_range).await.unwrap_err(),
            StoreError::Validation { .. }
        ));

        assert!(matches!(
            store.apply_delta(0, Delta::new("test")).await.unwrap_err(),
            StoreError::Validation { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_archives_only_records_at_threshold() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let seed = Delta::new("reflector")
            .add(StrategyDraft::new("keep me around", 0.9))
            .add(StrategyDraft::new("archive me soon", 0.9));
        store.apply_delta(0, seed).await?;

        // stg_001 → +5, stg_002 → −6.
        let mut evals = Delta::new("session-end");
        for _ in 0..5 {
            evals = evals.evaluate("stg_001", Outcome::Helpful, "kept helping");
        }
        for _ in 0..2 {
            evals = evals.evaluate("stg_002", Outcome::Harmful, "kept hurting");
        }
        store.apply_delta(1, evals).await?;

        let (version, cleanup) = store.cleanup_delta("cleanup").await;
        assert_eq!(version, 2);
        assert_eq!(cleanup.len(), 1);
        let outcome = store.apply_delta(version, cleanup).await?;
        assert_eq!(outcome.version, 3);
        assert_eq!(outcome.archived, vec!["stg_002"]);

        assert_eq!(store.get("stg_001").await.unwrap().status, StrategyStatus::Active);
        let archived = store.get("stg_002").await.unwrap();
        assert_eq!(archived.status, StrategyStatus::Archived);
        assert_eq!(archived.archived_reason.as_deref(), Some("score-threshold"));

        let history = store.history().load()?;
        let last = history.last().unwrap();
        assert_eq!(last.ops.len(), 1);
        match &last.ops[0] {
            AppliedOp::Archive { id, reason } => {
                assert_eq!(id, "stg_002");
                assert_eq!(reason, "score-threshold");
            }
            other => panic!("expected archive op, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn dedupe_delta_archives_lower_scored_twin() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        // Similar but below the add-time suppression threshold, so both land.
        let seed = Delta::new("reflector")
            .add(StrategyDraft::new("cache expensive lookups", 0.8))
            .add(StrategyDraft::new("cache expensive lookups aggressively", 0.8));
        store.apply_delta(0, seed).await?;
        assert_eq!(store.stats().await.total, 2);

        store
            .apply_delta(
                1,
                Delta::new("session-end").evaluate("stg_001", Outcome::Helpful, "useful"),
            )
            .await?;

        let (version, sweep) = store.dedupe_delta("cleanup", 0.60).await;
        assert_eq!(sweep.len(), 1);
        store.apply_delta(version, sweep).await?;

        let survivor = store.get("stg_001").await.unwrap();
        let loser = store.get("stg_002").await.unwrap();
        assert_eq!(survivor.status, StrategyStatus::Active);
        assert_eq!(loser.status, StrategyStatus::Archived);
        assert_eq!(loser.archived_reason.as_deref(), Some("duplicate of stg_001"));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_appliers_exactly_one_wins() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        let left = Delta::new("left").add(StrategyDraft::new("strategy from the left", 0.5));
        let right = Delta::new("right").add(StrategyDraft::new("strategy from the right", 0.5));
        let (a, b) = tokio::join!(store.apply_delta(0, left), store.apply_delta(0, right));

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(conflict.is_conflict());
        assert_eq!(store.version().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn reopen_restores_version_records_and_id_sequence() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = open_store(&dir).await;
            store
                .apply_delta(
                    0,
                    Delta::new("reflector")
                        .add(StrategyDraft::new("survive restarts", 0.9))
                        .add(StrategyDraft::new("and keep id numbering", 0.9)),
                )
                .await?;
            store
                .apply_delta(1, Delta::new("cleanup").archive("stg_002", "testing"))
                .await?;
        }

        let store = open_store(&dir).await;
        assert_eq!(store.version().await, 2);
        let stats = store.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.archived, 1);

        let outcome = store
            .apply_delta(
                2,
                Delta::new("reflector").add(StrategyDraft::new("a fresh strategy", 0.5)),
            )
            .await?;
        assert_eq!(outcome.added, vec!["stg_003"]);
        Ok(())
    }

    #[tokio::test]
    async fn history_entries_carry_collection_aggregates() -> Result<()> {
        let dir = TempDir::new()?;
        let store = open_store(&dir).await;

        store
            .apply_delta(
                0,
                Delta::new("reflector")
                    .add(StrategyDraft::new("strategy one", 0.5))
                    .add(StrategyDraft::new("strategy two", 0.5)),
            )
            .await?;
        store
            .apply_delta(
                1,
                Delta::new("session-end").evaluate("stg_001", Outcome::Helpful, "useful"),
            )
            .await?;

        let history = store.history().load()?;
        assert_eq!(history[0].active_count, 2);
        assert_eq!(history[0].mean_score, 0.0);
        assert_eq!(history[1].active_count, 2);
        assert!((history[1].mean_score - 0.5).abs() < f64::EPSILON);
        assert_eq!(history[1].version, 2);
        Ok(())
    }
}
