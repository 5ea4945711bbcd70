//! Poll driver: ticks every guarded job on its own interval.
//!
//! One tokio task per job. A job's ticks run sequentially inside its task, so
//! they never overlap within a process; a tick that overruns the interval
//! causes the missed ticks to be skipped rather than replayed in a burst.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tidepool_core::TickOutcome;

use crate::guard::GuardedJob;

/// Per-job counters and last result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_outcome: Option<TickOutcome>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn record(&mut self, outcome: TickOutcome) {
        self.ticks += 1;
        match &outcome {
            TickOutcome::Succeeded => self.succeeded += 1,
            TickOutcome::Failed(_) => self.failed += 1,
            TickOutcome::Skipped(_) => self.skipped += 1,
        }
        self.last_outcome = Some(outcome);
        self.last_tick_at = Some(Utc::now());
    }
}

/// Collects guarded jobs, then spawns them.
pub struct PollDriver {
    jobs: Vec<GuardedJob>,
    shutdown_grace: Duration,
    token: CancellationToken,
}

impl Default for PollDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PollDriver {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            shutdown_grace: Duration::from_secs(30),
            token: CancellationToken::new(),
        }
    }

    /// How long `shutdown` waits for in-flight ticks before aborting them.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Use a caller-owned token (e.g. one child of the application's root).
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_job(mut self, job: GuardedJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn add_job(&mut self, job: GuardedJob) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(GuardedJob::name).collect()
    }

    /// Spawn one task per job. Must be called inside a tokio runtime.
    pub fn spawn(self) -> DriverHandle {
        let mut tasks = Vec::with_capacity(self.jobs.len());
        let mut snapshots = Vec::with_capacity(self.jobs.len());

        for job in self.jobs {
            let snapshot = Arc::new(Mutex::new(JobSnapshot {
                name: job.name().to_string(),
                ..JobSnapshot::default()
            }));
            snapshots.push(snapshot.clone());
            tasks.push(tokio::spawn(poll_loop(job, self.token.clone(), snapshot)));
        }

        info!(jobs = tasks.len(), "poll driver started");
        DriverHandle {
            token: self.token,
            tasks,
            snapshots,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

async fn poll_loop(job: GuardedJob, token: CancellationToken, snapshot: Arc<Mutex<JobSnapshot>>) {
    let period = job.interval().max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = job.execute(&token).await;
        debug!(job = %job.name(), outcome = ?outcome, "tick finished");
        if let Ok(mut snap) = snapshot.lock() {
            snap.record(outcome);
        }
    }

    debug!(job = %job.name(), "poll loop stopped");
}

/// Handle to a running driver.
#[derive(Debug)]
pub struct DriverHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    snapshots: Vec<Arc<Mutex<JobSnapshot>>>,
    shutdown_grace: Duration,
}

impl DriverHandle {
    /// The token handed to every tick; cancelling it begins shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.snapshots
            .iter()
            .filter_map(|s| s.lock().ok().map(|s| s.clone()))
            .collect()
    }

    /// Cancel all jobs and wait up to the grace period for in-flight ticks.
    ///
    /// Returns `true` if every task stopped on its own; stragglers are
    /// aborted. Locks they held are released by their lease drop or, for a
    /// Postgres session, when the connection goes away.
    pub async fn shutdown(mut self) -> bool {
        self.token.cancel();
        let joined = tokio::time::timeout(
            self.shutdown_grace,
            futures::future::join_all(self.tasks.iter_mut()),
        )
        .await;

        match joined {
            Ok(results) => {
                for res in results {
                    if let Err(e) = res {
                        warn!(error = %e, "poll task ended abnormally");
                    }
                }
                info!("poll driver stopped");
                true
            }
            Err(_) => {
                let stragglers = self.tasks.iter().filter(|t| !t.is_finished()).count();
                warn!(
                    stragglers,
                    grace_secs = self.shutdown_grace.as_secs(),
                    "shutdown grace period elapsed, aborting remaining ticks"
                );
                for task in &self.tasks {
                    task.abort();
                }
                false
            }
        }
    }
}
