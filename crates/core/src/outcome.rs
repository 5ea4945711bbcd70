//! Per-tick outcomes of recurring jobs.

use serde::{Deserialize, Serialize};

/// Why a tick did not run the job's work.
///
/// Skips are expected steady-state results: they are not errors and are never
/// retried outside the next natural poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `worker.<name>.disabled` is `"true"`.
    Disabled,
    /// `next_run_at` lies in the future.
    NotDue,
    /// Another session holds the job's lock.
    LockContended,
    /// The lock backend failed; treated as contention.
    LockError,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::NotDue => "not_due",
            SkipReason::LockContended => "lock_contended",
            SkipReason::LockError => "lock_error",
        }
    }
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one tick of one job instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum TickOutcome {
    Skipped(SkipReason),
    Succeeded,
    Failed(String),
}

impl TickOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TickOutcome::Succeeded)
    }

    pub fn failed(err: impl core::fmt::Display) -> Self {
        TickOutcome::Failed(err.to_string())
    }
}
