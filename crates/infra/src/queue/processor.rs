//! Queue processor: claim, dispatch, settle.
//!
//! Each step claims one item, runs its handler inside an isolation boundary
//! (panics become failures, shutdown abandons the attempt) and records the
//! outcome. Nothing that happens to one item escapes the step, so a tick always
//! returns cleanly to the outer poll loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tidepool_core::{BackoffPolicy, FailOutcome, FailureKind, ItemId, QueueItem, WorkerId};

use super::registry::HandlerRegistry;
use super::store::QueueStore;
use crate::guard::{JobSpec, RecurringJob};
use crate::isolation::{catch_fault, or_cancelled};

/// `last_error` of items whose type has no handler.
pub const NO_HANDLER: &str = "no handler registered";

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub backoff: BackoffPolicy,
    /// Age after which a `Processing` claim is considered abandoned.
    pub stale_after: Duration,
    /// Max items per tick.
    pub batch_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            stale_after: Duration::from_secs(900),
            batch_size: 16,
        }
    }
}

impl ProcessorConfig {
    pub fn with_backoff_base(mut self, base: u64) -> Self {
        self.backoff = BackoffPolicy::new(base);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What one processing step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing eligible (or shutting down).
    Idle,
    Completed(ItemId),
    Retrying { id: ItemId, retry_count: u32 },
    DeadLettered(ItemId),
    /// Shutdown interrupted the handler; the item stays claimed until its
    /// claim goes stale.
    Abandoned(ItemId),
    /// The handler finished but recording the result failed; the item stays
    /// claimed until its claim goes stale.
    Unsettled(ItemId),
    /// The claim itself failed.
    StoreUnavailable,
}

/// Processor counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub panicked: u64,
    pub abandoned: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    panicked: AtomicU64,
    abandoned: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handler verdict before it is persisted.
enum Verdict {
    Done,
    Failed { message: String, kind: FailureKind },
    Abandoned,
}

/// Reliable queue processor for one worker identity.
#[derive(Clone)]
pub struct QueueProcessor {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    worker_id: WorkerId,
    config: ProcessorConfig,
    counters: Arc<Counters>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        worker_id: WorkerId,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            worker_id,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    /// Claim and process at most one item.
    pub async fn process_one(&self, cancel: &CancellationToken) -> StepOutcome {
        if cancel.is_cancelled() {
            return StepOutcome::Idle;
        }

        // Not raced against the token: an interrupted claim could leave a row
        // claimed without us knowing which.
        let item = match self
            .store
            .claim_next(&self.worker_id, self.config.stale_after)
            .await
        {
            Ok(Some(item)) => item,
            Ok(None) => return StepOutcome::Idle,
            Err(e) => {
                Counters::bump(&self.counters.store_errors);
                warn!(worker = %self.worker_id, error = %e, "failed to claim queue item");
                return StepOutcome::StoreUnavailable;
            }
        };
        Counters::bump(&self.counters.claimed);
        debug!(
            item_id = %item.id,
            item_type = %item.item_type,
            retry_count = item.retry_count,
            "claimed queue item"
        );

        match self.dispatch(&item, cancel).await {
            Verdict::Done => self.settle_completed(&item).await,
            Verdict::Failed { message, kind } => {
                let backoff = match kind {
                    FailureKind::Retriable => self.config.backoff.delay(item.retry_count),
                    FailureKind::Permanent => Duration::ZERO,
                };
                self.settle_failed(&item, &message, backoff, kind).await
            }
            Verdict::Abandoned => {
                Counters::bump(&self.counters.abandoned);
                info!(
                    item_id = %item.id,
                    item_type = %item.item_type,
                    "handler interrupted by shutdown, leaving item claimed"
                );
                StepOutcome::Abandoned(item.id)
            }
        }
    }

    async fn dispatch(&self, item: &QueueItem, cancel: &CancellationToken) -> Verdict {
        let Some(handler) = self.registry.get(&item.item_type) else {
            warn!(item_id = %item.id, item_type = %item.item_type, "{NO_HANDLER}");
            return Verdict::Failed {
                message: NO_HANDLER.to_string(),
                kind: FailureKind::Permanent,
            };
        };

        match catch_fault(or_cancelled(cancel, handler.handle(item, cancel))).await {
            Ok(Ok(Ok(()))) => Verdict::Done,
            Ok(Ok(Err(e))) => Verdict::Failed {
                message: e.message().to_string(),
                kind: e.kind(),
            },
            Ok(Err(_cancelled)) => Verdict::Abandoned,
            Err(fault) => {
                Counters::bump(&self.counters.panicked);
                error!(
                    item_id = %item.id,
                    item_type = %item.item_type,
                    panic = %fault.message,
                    "handler panicked"
                );
                Verdict::Failed {
                    message: fault.to_string(),
                    kind: FailureKind::Retriable,
                }
            }
        }
    }

    async fn settle_completed(&self, item: &QueueItem) -> StepOutcome {
        match self.store.complete(item.id, &self.worker_id).await {
            Ok(()) => {
                Counters::bump(&self.counters.completed);
                debug!(item_id = %item.id, item_type = %item.item_type, "queue item completed");
                StepOutcome::Completed(item.id)
            }
            Err(e) => {
                Counters::bump(&self.counters.store_errors);
                warn!(item_id = %item.id, error = %e, "failed to record completion");
                StepOutcome::Unsettled(item.id)
            }
        }
    }

    async fn settle_failed(
        &self,
        item: &QueueItem,
        message: &str,
        backoff: Duration,
        kind: FailureKind,
    ) -> StepOutcome {
        match self
            .store
            .fail(item.id, &self.worker_id, message, backoff, kind)
            .await
        {
            Ok(FailOutcome::Retrying {
                retry_count,
                available_at,
            }) => {
                Counters::bump(&self.counters.retried);
                info!(
                    item_id = %item.id,
                    item_type = %item.item_type,
                    retry_count,
                    %available_at,
                    error = %message,
                    "queue item failed, scheduled for retry"
                );
                StepOutcome::Retrying {
                    id: item.id,
                    retry_count,
                }
            }
            Ok(FailOutcome::DeadLettered { retry_count }) => {
                Counters::bump(&self.counters.dead_lettered);
                warn!(
                    item_id = %item.id,
                    item_type = %item.item_type,
                    retry_count,
                    error = %message,
                    "queue item dead-lettered"
                );
                StepOutcome::DeadLettered(item.id)
            }
            Err(e) => {
                Counters::bump(&self.counters.store_errors);
                warn!(item_id = %item.id, error = %e, "failed to record failure");
                StepOutcome::Unsettled(item.id)
            }
        }
    }

    /// Process up to `batch_size` items. Stops early when the queue is empty,
    /// the store is unreachable or shutdown is requested.
    pub async fn run_tick(&self, cancel: &CancellationToken) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..self.config.batch_size {
            let outcome = self.process_one(cancel).await;
            let stop = matches!(
                outcome,
                StepOutcome::Idle | StepOutcome::StoreUnavailable | StepOutcome::Abandoned(_)
            );
            if outcome != StepOutcome::Idle {
                outcomes.push(outcome);
            }
            if stop {
                break;
            }
        }
        outcomes
    }
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

/// The processor as a recurring job, so it runs under the scheduling guard
/// (kill switch `worker.queue-processor.disabled`).
///
/// No advisory lock by default: claims are already exclusive per item, and
/// every instance should drain the queue concurrently.
pub struct QueueProcessorJob {
    spec: JobSpec,
    processor: QueueProcessor,
}

impl QueueProcessorJob {
    pub const NAME: &'static str = "queue-processor";

    pub fn new(processor: QueueProcessor, interval: Duration) -> Self {
        Self {
            spec: JobSpec::new(Self::NAME, interval),
            processor,
        }
    }

    pub fn with_spec(processor: QueueProcessor, spec: JobSpec) -> Self {
        Self { spec, processor }
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }
}

#[async_trait::async_trait]
impl RecurringJob for QueueProcessorJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let outcomes = self.processor.run_tick(cancel).await;
        if !outcomes.is_empty() {
            debug!(steps = outcomes.len(), "queue tick finished");
        }
        Ok(())
    }
}
