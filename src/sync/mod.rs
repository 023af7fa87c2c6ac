//! Mirror synchronization: per-pass engine, task bookkeeping, schedule
//! evaluation, and the per-source scheduler that drives it all.

pub mod engine;
pub mod schedule;
pub mod scheduler;
pub mod task;

pub use scheduler::{SourceStatus, SyncScheduler};
pub use task::{SyncTask, TaskStatus};
