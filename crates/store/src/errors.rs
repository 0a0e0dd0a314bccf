/// Store mutation errors.
///
/// `Validation` and `Conflict` are the two outcomes a caller of
/// `apply_delta` must distinguish: the first means the delta itself is
/// unusable, the second means the caller's read is stale and a re-read plus
/// retry will succeed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid delta: {reason}")]
    Validation { reason: String },

    #[error("version conflict: caller read version {expected}, store is at {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// True when retrying with a freshly read version can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
