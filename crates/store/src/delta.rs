use serde::{Deserialize, Serialize};

use crate::schema::Outcome;

/// A proposed strategy as produced by a collaborator, before the store has
/// assigned an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDraft {
    /// Explicit id.  Leave `None` to let the store assign the next `stg_NNN`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    pub atomicity: f32,
}

impl StrategyDraft {
    pub fn new(text: impl Into<String>, atomicity: f32) -> Self {
        Self {
            id: None,
            text: text.into(),
            atomicity,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// The mutable half of an `Update` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateChange {
    /// Fold an evaluation outcome into the record's score.
    Score {
        outcome: Outcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Relabel the record's producing source.
    Source { source: String },
}

/// One operation inside a [`Delta`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    Add { draft: StrategyDraft },
    Update {
        id: String,
        change: UpdateChange,
        reason: String,
    },
    Archive { id: String, reason: String },
}

/// An atomic batch of operations from one collaborator.  Applying a delta
/// either lands every operation or none of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Which collaborator produced the batch (e.g. `reflector`,
    /// `session-end`, `cleanup`).
    pub source: String,
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: DeltaOp) {
        self.ops.push(op);
    }

    pub fn add(mut self, draft: StrategyDraft) -> Self {
        self.ops.push(DeltaOp::Add { draft });
        self
    }

    pub fn evaluate(
        mut self,
        id: impl Into<String>,
        outcome: Outcome,
        reason: impl Into<String>,
    ) -> Self {
        self.ops.push(DeltaOp::Update {
            id: id.into(),
            change: UpdateChange::Score {
                outcome,
                note: None,
            },
            reason: reason.into(),
        });
        self
    }

    pub fn archive(mut self, id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.ops.push(DeltaOp::Archive {
            id: id.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An operation as it was actually applied, recorded in history.  A
/// suppressed duplicate `Add` appears here as the `Update` it became.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AppliedOp {
    Add { id: String },
    Update {
        id: String,
        change: UpdateChange,
        reason: String,
    },
    Archive { id: String, reason: String },
}

impl AppliedOp {
    pub fn id(&self) -> &str {
        match self {
            Self::Add { id } | Self::Update { id, .. } | Self::Archive { id, .. } => id,
        }
    }
}
