pub mod bridge;
pub mod reconciler;
pub mod retry;
pub mod scheduler;

pub use bridge::{Bridge, DeltaCallback, MergeCallback, PollMode, SyncState};
pub use reconciler::DeltaReconciler;
pub use retry::ConflictRetryPolicy;
pub use scheduler::Scheduler;
