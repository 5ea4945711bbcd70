//! Queue item storage abstraction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use tidepool_core::{
    DomainError, FailOutcome, FailureKind, ItemId, ItemStatus, NewItem, QueueItem, WorkerId,
};

/// Queue store error.
#[derive(Debug, Error)]
pub enum QueueStoreError {
    #[error("queue item not found: {0}")]
    NotFound(ItemId),

    /// The item is no longer `Processing` under this worker (completed by
    /// someone else, or reclaimed after the claim went stale).
    #[error("claim on queue item {0} is no longer held by this worker")]
    ClaimLost(ItemId),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid queue item: {0}")]
    Invalid(String),

    #[error("queue storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for QueueStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => QueueStoreError::InvalidTransition(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                QueueStoreError::Invalid(msg)
            }
        }
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::Processing => self.processing += count,
            ItemStatus::Completed => self.completed += count,
            ItemStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Persistence for queue items.
///
/// Every mutation is serialized by the backing store; in particular
/// `claim_next` must never hand the same item to two concurrent claimers.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new `Pending` item with `retry_count = 0`.
    async fn enqueue(&self, item: NewItem) -> Result<QueueItem, QueueStoreError>;

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueStoreError>;

    /// Atomically claim the oldest eligible item for `worker`.
    ///
    /// Eligible: `Pending` with `available_at <= now`, or `Processing` with a
    /// claim older than `stale_after` (a reclaim, counted as a failed attempt).
    /// Stale items with no budget left are dead-lettered on the way.
    /// `Ok(None)` means nothing to do.
    async fn claim_next(
        &self,
        worker: &WorkerId,
        stale_after: Duration,
    ) -> Result<Option<QueueItem>, QueueStoreError>;

    /// `Processing` → `Completed`, only for the claiming worker.
    async fn complete(&self, id: ItemId, worker: &WorkerId) -> Result<(), QueueStoreError>;

    /// Record a failed attempt; see [`QueueItem::fail`] for the rules.
    async fn fail(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        backoff: Duration,
        kind: FailureKind,
    ) -> Result<FailOutcome, QueueStoreError>;

    /// Items in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError>;

    /// Replay a dead-lettered item with a fresh budget.
    async fn requeue(&self, id: ItemId) -> Result<QueueItem, QueueStoreError>;

    /// Delete `Completed` items last updated before `older_than`.
    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, QueueStoreError>;

    async fn stats(&self) -> Result<QueueStats, QueueStoreError>;
}

#[async_trait::async_trait]
impl<S: QueueStore + ?Sized> QueueStore for Arc<S> {
    async fn enqueue(&self, item: NewItem) -> Result<QueueItem, QueueStoreError> {
        (**self).enqueue(item).await
    }

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueStoreError> {
        (**self).get(id).await
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        stale_after: Duration,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        (**self).claim_next(worker, stale_after).await
    }

    async fn complete(&self, id: ItemId, worker: &WorkerId) -> Result<(), QueueStoreError> {
        (**self).complete(id, worker).await
    }

    async fn fail(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        backoff: Duration,
        kind: FailureKind,
    ) -> Result<FailOutcome, QueueStoreError> {
        (**self).fail(id, worker, error, backoff, kind).await
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn requeue(&self, id: ItemId) -> Result<QueueItem, QueueStoreError> {
        (**self).requeue(id).await
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        (**self).prune_completed(older_than).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        (**self).stats().await
    }
}
