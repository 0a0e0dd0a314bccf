pub mod collection;
pub mod dedupe;
pub mod delta;
pub mod errors;
pub mod history;
pub mod schema;
pub mod store;

pub use collection::Collection;
pub use delta::{AppliedOp, Delta, DeltaOp, StrategyDraft, UpdateChange};
pub use errors::StoreError;
pub use history::{HistoryEntry, HistoryLog};
pub use schema::{Evaluation, Outcome, StrategyRecord, StrategyStatus};
pub use store::{ApplyOutcome, Store, StoreStats};
