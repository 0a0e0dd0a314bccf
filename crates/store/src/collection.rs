use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::StrategyRecord;

/// The playbook itself: strategy records in stable insertion order plus
/// collection-level metadata.
///
/// `version` increments by exactly 1 per applied delta and never decreases.
/// Records are never removed; archival flips their status and keeps them in
/// place so ids stay unique for the lifetime of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    records: Vec<StrategyRecord>,
}

impl Collection {
    pub fn new() -> Self {
        Self {
            version: 0,
            last_updated: Utc::now(),
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[StrategyRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&StrategyRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut StrategyRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    /// Append a record, refusing duplicates by id.
    pub(crate) fn insert(&mut self, record: StrategyRecord) -> bool {
        if self.contains(&record.id) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Active records in insertion order.
    pub fn active(&self) -> Vec<&StrategyRecord> {
        self.records.iter().filter(|r| r.is_active()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mean score over active records; 0.0 when none are active.
    pub fn mean_score(&self) -> f64 {
        let active = self.active();
        if active.is_empty() {
            return 0.0;
        }
        active.iter().map(|r| r.score as f64).sum::<f64>() / active.len() as f64
    }

    /// Next auto-assigned id.  Continues from the highest existing `stg_NNN`
    /// suffix so ids are never reused, archived records included.
    pub fn next_id(&self) -> String {
        let max_seen = self
            .records
            .iter()
            .filter_map(|r| r.id.strip_prefix("stg_"))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("stg_{:03}", max_seen + 1)
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}
