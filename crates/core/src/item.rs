//! Queue item model and its state machine.
//!
//! ```text
//! Pending -> Processing -> Completed            (terminal)
//!                       -> Pending              (retry, budget remains)
//!                       -> Failed               (terminal, dead-letter)
//! ```
//!
//! A `Processing` item whose claim is older than the staleness window can be
//! reclaimed. A reclaim counts as a failed attempt; if the budget is already
//! spent the item is dead-lettered instead.
//!
//! Stores apply these transitions (the in-memory store calls them directly, the
//! Postgres store mirrors them in SQL), so the rules live in one place.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ItemId, WorkerId};

/// Retry budget used when a producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// `last_error` recorded when a stale claim is taken over.
pub const CLAIM_EXPIRED: &str = "claim expired";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for `available_at` and a claimer.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Dead-lettered.
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl core::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown item status '{other}'"
            ))),
        }
    }
}

/// How a failure should be treated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Redeliver after backoff while budget remains.
    Retriable,
    /// Dead-letter now; retrying cannot help (e.g. no handler for the type).
    Permanent,
}

/// Result of recording a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        retry_count: u32,
    },
}

/// Whether an item can be claimed right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Eligibility {
    NotEligible,
    /// `Pending` and available.
    Ready,
    /// `Processing` with an expired claim and budget left for a reclaim.
    StaleClaim,
    /// `Processing` with an expired claim and no budget left.
    StaleExhausted,
}

/// Producer request for a new item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub item_type: String,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    /// `None` means "available immediately".
    pub available_at: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn new(item_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            item_type: item_type.into(),
            payload,
            max_retries: DEFAULT_MAX_RETRIES,
            available_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defer the first delivery until `at`.
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.item_type.trim().is_empty() {
            return Err(DomainError::validation("item_type must not be empty"));
        }
        Ok(())
    }
}

/// A unit of queued work.
///
/// `payload` is opaque here; only the handler registered for `item_type`
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub item_type: String,
    pub payload: serde_json::Value,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Materialize a producer request as a fresh `Pending` item.
    pub fn from_new(new: NewItem, now: DateTime<Utc>) -> Result<Self, DomainError> {
        new.validate()?;
        Ok(Self {
            id: ItemId::new(),
            item_type: new.item_type,
            payload: new.payload,
            status: ItemStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            claimed_by: None,
            claimed_at: None,
            available_at: new.available_at.unwrap_or(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn budget_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn claim_expired(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.claimed_at {
            Some(at) => now - at > to_chrono(stale_after),
            // A Processing row without a claim time cannot be owned by anyone.
            None => true,
        }
    }

    pub fn eligibility(&self, now: DateTime<Utc>, stale_after: Duration) -> Eligibility {
        match self.status {
            ItemStatus::Pending if self.available_at <= now => Eligibility::Ready,
            ItemStatus::Processing if self.claim_expired(now, stale_after) => {
                if self.budget_exhausted() {
                    Eligibility::StaleExhausted
                } else {
                    Eligibility::StaleClaim
                }
            }
            _ => Eligibility::NotEligible,
        }
    }

    /// Take ownership for `worker`. Callers must have checked [`eligibility`].
    ///
    /// [`eligibility`]: QueueItem::eligibility
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), DomainError> {
        match self.status {
            ItemStatus::Pending => {}
            ItemStatus::Processing => {
                if self.budget_exhausted() {
                    return Err(DomainError::invalid_transition(format!(
                        "item {} has no retry budget left for a reclaim",
                        self.id
                    )));
                }
                self.retry_count += 1;
                self.last_error = Some(CLAIM_EXPIRED.to_string());
            }
            status => {
                return Err(DomainError::invalid_transition(format!(
                    "cannot claim item {} in status {status}",
                    self.id
                )));
            }
        }

        self.status = ItemStatus::Processing;
        self.claimed_by = Some(worker.clone());
        self.claimed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Dead-letter an item whose claim went stale after its budget was spent.
    pub fn expire_claim(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != ItemStatus::Processing {
            return Err(DomainError::invalid_transition(format!(
                "cannot expire claim of item {} in status {}",
                self.id, self.status
            )));
        }
        self.status = ItemStatus::Failed;
        self.last_error = Some(CLAIM_EXPIRED.to_string());
        self.updated_at = now;
        Ok(())
    }

    fn ensure_owned_by(&self, worker: &WorkerId) -> Result<(), DomainError> {
        if self.status != ItemStatus::Processing || self.claimed_by.as_ref() != Some(worker) {
            return Err(DomainError::invalid_transition(format!(
                "item {} is not claimed by {worker} (status {})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn complete(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_owned_by(worker)?;
        self.status = ItemStatus::Completed;
        self.updated_at = now;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With budget left (`retry_count < max_retries`) and a retriable failure
    /// the item returns to `Pending`, `retry_count` grows by one and it becomes
    /// available again after `backoff`. Otherwise it is dead-lettered and
    /// `retry_count` stays where it is.
    pub fn fail(
        &mut self,
        worker: &WorkerId,
        error: &str,
        backoff: Duration,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, DomainError> {
        self.ensure_owned_by(worker)?;
        self.last_error = Some(error.to_string());
        self.updated_at = now;

        if kind == FailureKind::Permanent || self.budget_exhausted() {
            self.status = ItemStatus::Failed;
            return Ok(FailOutcome::DeadLettered {
                retry_count: self.retry_count,
            });
        }

        self.retry_count += 1;
        self.status = ItemStatus::Pending;
        self.available_at = add_saturating(now, backoff);
        self.claimed_by = None;
        self.claimed_at = None;
        Ok(FailOutcome::Retrying {
            retry_count: self.retry_count,
            available_at: self.available_at,
        })
    }

    /// Move a dead-lettered item back to the queue with a fresh budget.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != ItemStatus::Failed {
            return Err(DomainError::invalid_transition(format!(
                "only failed items can be requeued (item {} is {})",
                self.id, self.status
            )));
        }
        self.status = ItemStatus::Pending;
        self.retry_count = 0;
        self.available_at = now;
        self.claimed_by = None;
        self.claimed_at = None;
        self.updated_at = now;
        Ok(())
    }
}

/// Convert a std duration to chrono, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, clamped to the largest representable instant.
pub fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use crate::backoff::compute_backoff_seconds;

    const STALE: Duration = Duration::from_secs(900);

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn item(max_retries: u32, now: DateTime<Utc>) -> QueueItem {
        QueueItem::from_new(
            NewItem::new("github.sync", serde_json::json!({"repo": "a/b"}))
                .with_max_retries(max_retries),
            now,
        )
        .unwrap()
    }

    #[test]
    fn new_items_start_pending_and_available() {
        let now = Utc::now();
        let it = item(3, now);
        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retry_count, 0);
        assert_eq!(it.available_at, now);
        assert_eq!(it.eligibility(now, STALE), Eligibility::Ready);
    }

    #[test]
    fn blank_type_is_rejected() {
        let res = QueueItem::from_new(NewItem::new(" ", serde_json::Value::Null), Utc::now());
        assert!(matches!(res, Err(DomainError::Validation(_))));
    }

    #[test]
    fn deferred_items_are_not_eligible_early() {
        let now = Utc::now();
        let later = now + ChronoDuration::minutes(5);
        let it = QueueItem::from_new(
            NewItem::new("t", serde_json::Value::Null).available_at(later),
            now,
        )
        .unwrap();
        assert_eq!(it.eligibility(now, STALE), Eligibility::NotEligible);
        assert_eq!(it.eligibility(later, STALE), Eligibility::Ready);
    }

    #[test]
    fn complete_requires_the_claiming_worker() {
        let now = Utc::now();
        let mut it = item(3, now);
        it.claim(&worker("a"), now).unwrap();

        assert!(it.complete(&worker("b"), now).is_err());
        it.complete(&worker("a"), now).unwrap();
        assert_eq!(it.status, ItemStatus::Completed);
        assert!(it.complete(&worker("a"), now).is_err());
    }

    #[test]
    fn scenario_max_three_base_four() {
        let mut now = Utc::now();
        let w = worker("w");
        let mut it = item(3, now);
        let mut seen_counts = Vec::new();
        let mut delays = Vec::new();

        loop {
            assert_eq!(it.eligibility(now, STALE), Eligibility::Ready);
            seen_counts.push(it.retry_count);
            it.claim(&w, now).unwrap();
            let delay = compute_backoff_seconds(it.retry_count, 4);
            match it
                .fail(&w, "boom", Duration::from_secs(delay), FailureKind::Retriable, now)
                .unwrap()
            {
                FailOutcome::Retrying { available_at, .. } => {
                    delays.push(delay);
                    now = available_at;
                }
                FailOutcome::DeadLettered { retry_count } => {
                    assert_eq!(retry_count, 3);
                    break;
                }
            }
        }

        assert_eq!(seen_counts, vec![0, 1, 2, 3]);
        assert_eq!(delays, vec![1, 4, 16]);
        assert_eq!(it.status, ItemStatus::Failed);
        assert_eq!(it.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn permanent_failure_dead_letters_without_retry() {
        let now = Utc::now();
        let w = worker("w");
        let mut it = item(5, now);
        it.claim(&w, now).unwrap();

        let out = it
            .fail(&w, "no handler registered", Duration::ZERO, FailureKind::Permanent, now)
            .unwrap();

        assert_eq!(out, FailOutcome::DeadLettered { retry_count: 0 });
        assert_eq!(it.status, ItemStatus::Failed);
    }

    #[test]
    fn stale_claim_is_reclaimed_as_a_failed_attempt() {
        let now = Utc::now();
        let mut it = item(2, now);
        it.claim(&worker("crashed"), now).unwrap();

        let later = now + ChronoDuration::seconds(901);
        assert_eq!(it.eligibility(now, STALE), Eligibility::NotEligible);
        assert_eq!(it.eligibility(later, STALE), Eligibility::StaleClaim);

        it.claim(&worker("rescuer"), later).unwrap();
        assert_eq!(it.retry_count, 1);
        assert_eq!(it.claimed_by, Some(worker("rescuer")));
        assert_eq!(it.last_error.as_deref(), Some(CLAIM_EXPIRED));

        // The original owner can no longer settle it.
        assert!(it.complete(&worker("crashed"), later).is_err());
    }

    #[test]
    fn stale_claim_without_budget_is_dead_lettered() {
        let now = Utc::now();
        let mut it = item(0, now);
        it.claim(&worker("crashed"), now).unwrap();
        let later = now + ChronoDuration::hours(1);

        assert_eq!(it.eligibility(later, STALE), Eligibility::StaleExhausted);
        assert!(it.claim(&worker("rescuer"), later).is_err());
        it.expire_claim(later).unwrap();
        assert_eq!(it.status, ItemStatus::Failed);
    }

    #[test]
    fn requeue_only_from_failed() {
        let now = Utc::now();
        let w = worker("w");
        let mut it = item(0, now);
        assert!(it.requeue(now).is_err());

        it.claim(&w, now).unwrap();
        it.fail(&w, "x", Duration::ZERO, FailureKind::Retriable, now).unwrap();
        it.requeue(now).unwrap();

        assert_eq!(it.status, ItemStatus::Pending);
        assert_eq!(it.retry_count, 0);
        assert!(it.claimed_by.is_none());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("done".parse::<ItemStatus>().is_err());
    }

    proptest! {
        #[test]
        fn always_failing_item_dead_letters_after_budget(max_retries in 0u32..12) {
            let w = worker("w");
            let mut now = Utc::now();
            let mut it = item(max_retries, now);
            let mut failures = 0u32;

            while it.status != ItemStatus::Failed {
                prop_assert!(it.retry_count <= it.max_retries);
                it.claim(&w, now).unwrap();
                it.fail(&w, "e", Duration::from_secs(1), FailureKind::Retriable, now).unwrap();
                failures += 1;
                now += ChronoDuration::seconds(1);
            }

            prop_assert_eq!(failures, max_retries + 1);
            prop_assert_eq!(it.retry_count, max_retries);
        }
    }
}
