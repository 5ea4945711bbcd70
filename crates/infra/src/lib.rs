//! Infrastructure layer: runtime state, advisory locks, the scheduling guard,
//! the reliable queue and the poll driver, with in-memory and Postgres
//! backends.

pub mod config;
pub mod driver;
pub mod guard;
pub mod isolation;
pub mod lock;
pub mod queue;
pub mod schema;
pub mod state_store;
pub mod tracker;


pub use config::{ConfigError, WorkerConfig};
pub use driver::{DriverHandle, JobSnapshot, PollDriver};
pub use guard::{Cadence, GuardedJob, JobSpec, RecurringJob, SchedulingGuard};
pub use isolation::{Cancelled, Fault, catch_fault, or_cancelled};
pub use lock::{AdvisoryLock, LockError, LockLease};
pub use queue::{
    HandlerError, HandlerRegistry, ItemHandler, ProcessorConfig, ProcessorStats, QueueProcessor,
    QueueProcessorJob, QueuePruneJob, QueueStats, QueueStore, QueueStoreError, StepOutcome,
};
pub use schema::ensure_schema;
pub use state_store::{StateStore, StateStoreError, StateStoreExt};
pub use tracker::{TrackedJobSweeper, TrackedJobs, TrackedRecord};
