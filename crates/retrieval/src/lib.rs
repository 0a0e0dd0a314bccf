pub mod backend;
pub mod coordinator;
pub mod embedding;
pub mod errors;
pub mod local;
#[cfg(feature = "qdrant")]
pub mod qdrant;
pub mod retry;

pub use backend::{BackendStats, Hit, IndexPoint, SearchFilter, VectorBackend};
pub use coordinator::{BackendState, CoordinatorStatus, RankedStrategy, RetrievalCoordinator};
pub use embedding::{Embedder, EmbeddingClient};
pub use errors::RetrievalError;
#[cfg(feature = "qdrant")]
pub use qdrant::QdrantBackend;
pub use retry::RetryPolicy;
