//! Retention for completed items.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use chrono::{DateTime, Utc};
use tidepool_core::{Clock, LockId, SystemClock, to_chrono};

use super::store::QueueStore;
use crate::guard::{JobSpec, RecurringJob};

/// Deletes `Completed` items older than the retention window.
///
/// Runs under the advisory lock [`QueuePruneJob::LOCK_ID`] with a persisted
/// cadence, so the cluster prunes once per `every` no matter how many
/// instances poll.
pub struct QueuePruneJob {
    spec: JobSpec,
    store: Arc<dyn QueueStore>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl QueuePruneJob {
    pub const NAME: &'static str = "queue-prune";
    pub const LOCK_ID: LockId = LockId::new(0x7470_0001);

    pub fn new(store: Arc<dyn QueueStore>, retention: Duration, every: Duration) -> Self {
        Self {
            spec: JobSpec::new(Self::NAME, every)
                .with_lock(Self::LOCK_ID)
                .with_cadence("queue", every),
            store,
            retention,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait::async_trait]
impl RecurringJob for QueuePruneJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn run(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(to_chrono(self.retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.store.prune_completed(cutoff).await?;
        if deleted > 0 {
            info!(deleted, %cutoff, "pruned completed queue items");
        }
        Ok(())
    }
}
