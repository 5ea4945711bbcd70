//! `tidepool-core`: coordination domain building blocks.
//!
//! This crate contains **pure domain** primitives (no I/O): identifiers, the
//! queue item state machine, the backoff policy, runtime-state key layout and
//! tick outcomes.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;
pub mod item;
pub mod keys;
pub mod outcome;

pub use backoff::{BackoffPolicy, compute_backoff_seconds};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ItemId, LockId, WorkerId};
pub use item::{
    CLAIM_EXPIRED, DEFAULT_MAX_RETRIES, Eligibility, FailOutcome, FailureKind, ItemStatus, NewItem,
    QueueItem, add_saturating, to_chrono,
};
pub use outcome::{SkipReason, TickOutcome};
