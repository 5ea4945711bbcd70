//! Advisory lock manager: cross-process mutual exclusion for recurring jobs.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryLockSession, InMemoryLockTable};
pub use postgres::PostgresAdvisoryLock;
pub use r#trait::{AdvisoryLock, LockError, LockLease};
