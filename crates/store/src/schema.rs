use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a strategy record.
///
/// Archival is terminal: an archived record never returns to `Active`.  A
/// strategy worth reviving is re-added as a new record under a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Active,
    Archived,
}

impl StrategyStatus {
    /// Canonical label used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

/// Evaluation verdict reported by a collaborator after a strategy was used.
///
/// | Outcome   | Default score delta |
/// |-----------|---------------------|
/// | `Helpful` | +1                  |
/// | `Neutral` | −1                  |
/// | `Harmful` | −3                  |
///
/// The deltas come from configuration; the table shows the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Helpful,
    Neutral,
    Harmful,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Helpful => "helpful",
            Self::Neutral => "neutral",
            Self::Harmful => "harmful",
        }
    }

    /// Parse an outcome from its label (case-insensitive).
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "helpful" => Some(Self::Helpful),
            "neutral" => Some(Self::Neutral),
            "harmful" => Some(Self::Harmful),
            _ => None,
        }
    }
}

/// One applied evaluation: when it happened, the verdict, the delta it
/// contributed and the score it left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub delta: i64,
    pub score_after: i64,
    /// Optional free-text justification from the evaluating collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One learned strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    /// Unique, immutable once assigned.  Auto-assigned ids look like
    /// `stg_007`.
    pub id: String,
    pub text: String,
    pub score: i64,
    /// How self-contained the strategy is, in [0, 1].  Set at creation,
    /// never mutated.
    pub atomicity: f32,
    pub status: StrategyStatus,
    /// Label of the collaborator that produced the record.
    pub source: String,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_reason: Option<String>,
}

impl StrategyRecord {
    pub fn is_active(&self) -> bool {
        self.status == StrategyStatus::Active
    }
}
