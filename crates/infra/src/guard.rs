//! Self-scheduling guard for recurring jobs.
//!
//! Every poll tick of every instance runs the same protocol:
//!
//! 1. `worker.<name>.disabled == "true"` → skip.
//! 2. Job has its own cadence and `now < next_run_at` → skip.
//! 3. `try_lock(lock_id)` not acquired, or erroring → skip.
//! 4. Lock release is guaranteed from here on (success, error, panic, cancel).
//!    With the lock held, `next_run_at` is read again; a slot claimed by a run
//!    that finished in between → skip.
//! 5. Persist `next_run_at = now + cadence` *before* the work starts.
//! 6. Run the work under the caller's cancellation token.
//! 7. Release the lock.
//!
//! Claiming the slot before working means a slow or stuck run can never let
//! another tick (here or on another instance) start early. A failed slot write
//! only risks one missed tick and does not stop the run.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tidepool_core::item::add_saturating;
use tidepool_core::{Clock, LockId, SkipReason, SystemClock, TickOutcome, keys};

use crate::isolation::{Cancelled, catch_fault, or_cancelled};
use crate::lock::{AdvisoryLock, LockLease};
use crate::state_store::{StateStore, StateStoreExt};

/// A run cadence independent from the poll interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    pub every: Duration,
    pub next_run_key: String,
}

/// Static description of a recurring job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Unique job name; also the `worker.<name>.disabled` segment.
    pub name: String,
    /// How often the driver ticks the job.
    pub interval: Duration,
    /// Fleet-wide exclusivity. `None` lets every instance run concurrently.
    pub lock_id: Option<LockId>,
    pub cadence: Option<Cadence>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            lock_id: None,
            cadence: None,
        }
    }

    pub fn with_lock(mut self, lock_id: LockId) -> Self {
        self.lock_id = Some(lock_id);
        self
    }

    /// Run at most once per `every`, tracked under `<domain>.<name>.next_run_at`.
    pub fn with_cadence(mut self, domain: &str, every: Duration) -> Self {
        self.cadence = Some(Cadence {
            every,
            next_run_key: keys::next_run_at(domain, &self.name),
        });
        self
    }
}

/// The work a recurring job does once the guard lets it through.
#[async_trait::async_trait]
pub trait RecurringJob: Send + Sync {
    fn spec(&self) -> &JobSpec;

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Shared coordination context for guarded ticks.
#[derive(Clone)]
pub struct SchedulingGuard {
    state: Arc<dyn StateStore>,
    lock: Arc<dyn AdvisoryLock>,
    clock: Arc<dyn Clock>,
}

impl SchedulingGuard {
    pub fn new(state: Arc<dyn StateStore>, lock: Arc<dyn AdvisoryLock>) -> Self {
        Self::with_clock(state, lock, Arc::new(SystemClock))
    }

    pub fn with_clock(
        state: Arc<dyn StateStore>,
        lock: Arc<dyn AdvisoryLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { state, lock, clock }
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Run one tick of `spec`, executing `work` only if every check passes.
    ///
    /// `work` is lazy: it is never polled when the tick is skipped. A panic in
    /// `work` is reported as `Failed`.
    pub async fn run<W>(&self, spec: &JobSpec, cancel: &CancellationToken, work: W) -> TickOutcome
    where
        W: Future<Output = anyhow::Result<()>> + Send,
    {
        let job = spec.name.as_str();

        match or_cancelled(cancel, self.state.is_worker_disabled(job)).await {
            Err(Cancelled) => return TickOutcome::failed(Cancelled),
            Ok(Ok(true)) => {
                debug!(job, "skipping tick: disabled");
                return TickOutcome::Skipped(SkipReason::Disabled);
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                warn!(job, error = %e, "could not read disabled flag; abandoning tick");
                return TickOutcome::failed(e);
            }
        }

        if let Some(cadence) = &spec.cadence {
            if let Some(outcome) = self.check_due(job, cadence, cancel).await {
                return outcome;
            }
        }

        // Lock calls are non-blocking and are not raced against the token: a
        // dropped try_lock could leave a granted lock without a lease.
        if cancel.is_cancelled() {
            return TickOutcome::failed(Cancelled);
        }
        let lease = match spec.lock_id {
            None => None,
            Some(lock_id) => match LockLease::try_acquire(self.lock.clone(), lock_id).await {
                Ok(Some(lease)) => Some(lease),
                Ok(None) => {
                    debug!(job, %lock_id, "skipping tick: lock held elsewhere");
                    return TickOutcome::Skipped(SkipReason::LockContended);
                }
                Err(e) => {
                    warn!(job, %lock_id, error = %e, "skipping tick: lock acquisition failed");
                    return TickOutcome::Skipped(SkipReason::LockError);
                }
            },
        };

        if let Some(cadence) = &spec.cadence {
            // Another instance may have run and released between the first
            // read and our acquisition.
            if lease.is_some() {
                if let Some(outcome) = self.check_due(job, cadence, cancel).await {
                    release(job, lease).await;
                    return outcome;
                }
            }
            let next_run_at = add_saturating(self.clock.now(), cadence.every);
            if let Err(e) = self.state.set_time(&cadence.next_run_key, next_run_at).await {
                warn!(job, error = %e, "failed to claim next run slot; running anyway");
            }
        }

        debug!(job, "job run started");
        let started = Instant::now();
        let result = catch_fault(or_cancelled(cancel, work)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        release(job, lease).await;

        match result {
            Ok(Ok(Ok(()))) => {
                debug!(job, elapsed_ms, "job run succeeded");
                TickOutcome::Succeeded
            }
            Ok(Ok(Err(e))) => {
                let error = format!("{e:#}");
                warn!(job, elapsed_ms, %error, "job run failed");
                TickOutcome::Failed(error)
            }
            Ok(Err(Cancelled)) => {
                info!(job, elapsed_ms, "job run cancelled");
                TickOutcome::failed(Cancelled)
            }
            Err(fault) => {
                error!(job, elapsed_ms, error = %fault, "job run panicked");
                TickOutcome::failed(fault)
            }
        }
    }

    /// `None` when the job is due; otherwise the outcome that ends the tick.
    async fn check_due(
        &self,
        job: &str,
        cadence: &Cadence,
        cancel: &CancellationToken,
    ) -> Option<TickOutcome> {
        match or_cancelled(cancel, self.state.get_time(&cadence.next_run_key)).await {
            Err(Cancelled) => Some(TickOutcome::failed(Cancelled)),
            Ok(Ok(next_run_at)) if self.clock.now() < next_run_at => {
                debug!(job, %next_run_at, "skipping tick: not due");
                Some(TickOutcome::Skipped(SkipReason::NotDue))
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) if e.is_absent() => {
                debug!(job, error = %e, "no usable next_run_at; treating job as due");
                None
            }
            Ok(Err(e)) => {
                warn!(job, error = %e, "could not read next_run_at; abandoning tick");
                Some(TickOutcome::failed(e))
            }
        }
    }
}

async fn release(job: &str, lease: Option<LockLease>) {
    if let Some(lease) = lease {
        let lock_id = lease.id();
        if let Err(e) = lease.release().await {
            warn!(job, %lock_id, error = %e, "lock release failed");
        }
    }
}

/// A recurring job bound to its guard: the unit the poll driver ticks.
#[derive(Clone)]
pub struct GuardedJob {
    job: Arc<dyn RecurringJob>,
    guard: SchedulingGuard,
}

impl GuardedJob {
    pub fn new(job: Arc<dyn RecurringJob>, guard: SchedulingGuard) -> Self {
        Self { job, guard }
    }

    pub fn name(&self) -> &str {
        &self.job.spec().name
    }

    pub fn interval(&self) -> Duration {
        self.job.spec().interval
    }

    pub fn spec(&self) -> &JobSpec {
        self.job.spec()
    }

    pub async fn execute(&self, cancel: &CancellationToken) -> TickOutcome {
        self.guard
            .run(self.job.spec(), cancel, self.job.run(cancel))
            .await
    }
}
