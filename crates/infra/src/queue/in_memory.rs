use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use tidepool_core::{
    Clock, DomainError, Eligibility, FailOutcome, FailureKind, ItemId, ItemStatus, NewItem,
    QueueItem, SystemClock, WorkerId,
};

use super::store::{QueueStats, QueueStore, QueueStoreError};

/// In-memory queue store for tests/dev.
///
/// A single write lock serializes every mutation, which gives `claim_next` the
/// same exactly-one-winner guarantee the Postgres store gets from row locks.
pub struct InMemoryQueueStore {
    items: RwLock<HashMap<ItemId, QueueItem>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a stored item as-is (test fixtures: simulated crashes, aged rows).
    pub fn put(&self, item: QueueItem) -> Result<(), QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.insert(item.id, item);
        Ok(())
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> QueueStoreError {
    QueueStoreError::Storage("lock poisoned".to_string())
}

/// Map a rejected complete/fail transition to a lost claim.
fn claim_lost(id: ItemId) -> impl FnOnce(DomainError) -> QueueStoreError {
    move |err| match err {
        DomainError::InvalidTransition(_) => QueueStoreError::ClaimLost(id),
        other => other.into(),
    }
}

fn oldest_first(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    (a.available_at, a.created_at, a.id).cmp(&(b.available_at, b.created_at, b.id))
}

#[async_trait::async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, item: NewItem) -> Result<QueueItem, QueueStoreError> {
        let item = QueueItem::from_new(item, self.clock.now())?;
        let mut items = self.items.write().map_err(|_| poisoned())?;
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        Ok(items.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        stale_after: Duration,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().map_err(|_| poisoned())?;

        let mut best: Option<&QueueItem> = None;
        let mut exhausted = Vec::new();
        for item in items.values() {
            match item.eligibility(now, stale_after) {
                Eligibility::Ready | Eligibility::StaleClaim => {
                    if best.is_none_or(|b| oldest_first(item, b).is_lt()) {
                        best = Some(item);
                    }
                }
                Eligibility::StaleExhausted => exhausted.push(item.id),
                Eligibility::NotEligible => {}
            }
        }
        let chosen = best.map(|item| item.id);

        for id in exhausted {
            if let Some(item) = items.get_mut(&id) {
                warn!(
                    item_id = %id,
                    item_type = %item.item_type,
                    retry_count = item.retry_count,
                    "stale claim with no retry budget, dead-lettering"
                );
                item.expire_claim(now)?;
            }
        }

        let Some(id) = chosen else {
            return Ok(None);
        };
        let item = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        if item.status == ItemStatus::Processing {
            warn!(
                item_id = %id,
                previous_owner = ?item.claimed_by,
                "reclaiming stale item"
            );
        }
        item.claim(worker, now)?;
        Ok(Some(item.clone()))
    }

    async fn complete(&self, id: ItemId, worker: &WorkerId) -> Result<(), QueueStoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let item = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        item.complete(worker, now).map_err(claim_lost(id))
    }

    async fn fail(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        backoff: Duration,
        kind: FailureKind,
    ) -> Result<FailOutcome, QueueStoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let item = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        item.fail(worker, error, backoff, kind, now)
            .map_err(claim_lost(id))
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        let mut result: Vec<QueueItem> = items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect();
        result.sort_by(oldest_first);
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue(&self, id: ItemId) -> Result<QueueItem, QueueStoreError> {
        let now = self.clock.now();
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let item = items.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        item.requeue(now)?;
        Ok(item.clone())
    }

    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        let mut items = self.items.write().map_err(|_| poisoned())?;
        let before = items.len();
        items.retain(|_, item| {
            !(item.status == ItemStatus::Completed && item.updated_at < older_than)
        });
        Ok((before - items.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let items = self.items.read().map_err(|_| poisoned())?;
        let mut stats = QueueStats::default();
        for item in items.values() {
            stats.record(item.status, 1);
        }
        Ok(stats)
    }
}
