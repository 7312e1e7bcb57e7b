pub mod cycle;
pub mod lock;

use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use cycle::{
    BatchArtifacts, BatchDisposition, BatchReport, CycleError, CycleOutcome, CycleReport, Dispatcher,
};
pub use lock::{LockGuard, ProcessingLock};

/// Source of the current time for window decisions, checkpoints and leases
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
