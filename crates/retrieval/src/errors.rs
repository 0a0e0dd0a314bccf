/// Retrieval subsystem errors.
///
/// Neither variant ever reaches a search caller: the coordinator absorbs
/// them, switches backend state, and serves the score-ranked fallback
/// instead.  They exist so the embedding client and the backends can say
/// precisely what went wrong on the way down.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding service unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
}

impl RetrievalError {
    pub fn embedding(reason: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable {
            reason: reason.into(),
        }
    }

    pub fn backend(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RetrievalError;

    #[test]
    fn messages_name_the_failing_service() {
        let embedding = RetrievalError::embedding("connection refused");
        assert_eq!(
            embedding.to_string(),
            "embedding service unavailable: connection refused"
        );

        let backend = RetrievalError::backend("qdrant", "collection missing");
        assert_eq!(
            backend.to_string(),
            "qdrant backend unavailable: collection missing"
        );
    }
}
