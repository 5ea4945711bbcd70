use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tidepool_core::QueueItem;
use tidepool_infra::lock::{InMemoryLockTable, PostgresAdvisoryLock};
use tidepool_infra::queue::{InMemoryQueueStore, PostgresQueueStore};
use tidepool_infra::state_store::{InMemoryStateStore, PostgresStateStore};
use tidepool_infra::{
    AdvisoryLock, DriverHandle, GuardedJob, HandlerError, HandlerRegistry, ItemHandler,
    JobSnapshot, PollDriver, ProcessorStats, QueueProcessor, QueueProcessorJob, QueuePruneJob,
    QueueStore, RecurringJob, SchedulingGuard, StateStore, TrackedJobSweeper, WorkerConfig,
    ensure_schema,
};

/// The shared stores and the lock session one worker process uses.
#[derive(Clone)]
pub struct Backends {
    pub state: Arc<dyn StateStore>,
    pub queue: Arc<dyn QueueStore>,
    pub lock: Arc<dyn AdvisoryLock>,
    pool: Option<PgPool>,
}

impl Backends {
    /// Connect to `DATABASE_URL` and make sure the schema exists.
    pub async fn postgres(config: &WorkerConfig) -> anyhow::Result<Self> {
        let url = config.require_database_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        ensure_schema(&pool).await?;

        Ok(Self {
            state: Arc::new(PostgresStateStore::new(pool.clone())),
            queue: Arc::new(PostgresQueueStore::new(pool.clone())),
            // One session for every job of this process: a crash drops the
            // connection and with it every lock the process held.
            lock: Arc::new(PostgresAdvisoryLock::new(pool.clone())),
            pool: Some(pool),
        })
    }

    /// Process-local backends for tests and development. Share `locks` between
    /// several calls to simulate a cluster on one table.
    pub fn in_memory(
        state: Arc<InMemoryStateStore>,
        queue: Arc<InMemoryQueueStore>,
        locks: &InMemoryLockTable,
    ) -> Self {
        Self {
            state,
            queue,
            lock: Arc::new(locks.session()),
            pool: None,
        }
    }
}

/// Builder for a worker process.
pub struct WorkerApp {
    config: WorkerConfig,
    registry: HandlerRegistry,
    jobs: Vec<Arc<dyn RecurringJob>>,
}

impl WorkerApp {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            jobs: Vec::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn register_handler(
        &mut self,
        item_type: impl Into<String>,
        handler: Arc<dyn ItemHandler>,
    ) -> &mut Self {
        self.registry.register(item_type, handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, item_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(QueueItem, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_fn(item_type, f);
        self
    }

    /// Add an application recurring job; it runs under the scheduling guard.
    pub fn add_job(&mut self, job: Arc<dyn RecurringJob>) -> &mut Self {
        self.jobs.push(job);
        self
    }

    /// Connect to Postgres and start.
    pub async fn start_postgres(self) -> anyhow::Result<RunningWorker> {
        let backends = Backends::postgres(&self.config).await?;
        Ok(self.start(backends))
    }

    /// Wire the built-in jobs next to the application ones and spawn the driver.
    pub fn start(self, backends: Backends) -> RunningWorker {
        let config = self.config;
        let guard = SchedulingGuard::new(backends.state.clone(), backends.lock.clone());

        let processor = QueueProcessor::new(
            backends.queue.clone(),
            Arc::new(self.registry),
            config.worker_id.clone(),
            config.processor_config(),
        );

        let mut jobs = self.jobs;
        jobs.push(Arc::new(QueueProcessorJob::new(
            processor.clone(),
            config.processor_interval,
        )));
        jobs.push(Arc::new(QueuePruneJob::new(
            backends.queue.clone(),
            config.completed_retention,
            PRUNE_EVERY,
        )));
        if !config.tracked_prefixes.is_empty() {
            jobs.push(Arc::new(TrackedJobSweeper::new(
                backends.state.clone(),
                config.tracked_prefixes.clone(),
                config.tracked_max_age,
                SWEEP_EVERY,
            )));
        }

        let mut driver = PollDriver::new().with_shutdown_grace(config.shutdown_grace);
        for job in jobs {
            info!(
                job = %job.spec().name,
                interval_ms = job.spec().interval.as_millis() as u64,
                "registered recurring job"
            );
            driver.add_job(GuardedJob::new(job, guard.clone()));
        }

        info!(worker = %config.worker_id, "worker starting");
        RunningWorker {
            handle: driver.spawn(),
            processor,
            backends,
        }
    }
}

const PRUNE_EVERY: std::time::Duration = std::time::Duration::from_secs(3600);
const SWEEP_EVERY: std::time::Duration = std::time::Duration::from_secs(300);

/// A started worker.
pub struct RunningWorker {
    handle: DriverHandle,
    processor: QueueProcessor,
    backends: Backends,
}

impl RunningWorker {
    /// Producer/admin access to the queue.
    pub fn queue(&self) -> &Arc<dyn QueueStore> {
        &self.backends.queue
    }

    /// Kill switches and other runtime state.
    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.backends.state
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.handle.snapshot()
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    /// Stop all jobs, then close the database pool. Returns `false` if some
    /// tick had to be aborted after the grace period.
    pub async fn shutdown(self) -> bool {
        let clean = self.handle.shutdown().await;
        if let Some(pool) = self.backends.pool {
            pool.close().await;
        }
        info!(clean, "worker stopped");
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tidepool_core::{ItemStatus, NewItem, WorkerId};
    use tidepool_infra::StateStoreExt;

    fn config(name: &str) -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(WorkerId::new(name).unwrap())
            .with_processor_interval(Duration::from_millis(10))
            .with_shutdown_grace(Duration::from_secs(1))
    }

    async fn wait_for(done: impl Fn() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn processes_queued_items_until_shutdown() {
        let locks = InMemoryLockTable::new();
        let queue = InMemoryQueueStore::arc();
        let state = InMemoryStateStore::arc();

        let mut app = WorkerApp::new(config("worker-a"));
        app.register_fn("greet", |item: QueueItem, _cancel| async move {
            if item.payload["name"].is_string() {
                Ok(())
            } else {
                Err(HandlerError::permanent("name missing"))
            }
        });
        let worker = app.start(Backends::in_memory(state, queue.clone(), &locks));

        let ok = worker
            .queue()
            .enqueue(NewItem::new("greet", serde_json::json!({ "name": "ada" })))
            .await
            .unwrap();
        let bad = worker
            .queue()
            .enqueue(NewItem::new("greet", serde_json::json!({})))
            .await
            .unwrap();

        wait_for(|| {
            let stats = worker.processor_stats();
            stats.completed == 1 && stats.dead_lettered == 1
        })
        .await;

        assert_eq!(queue.get(ok.id).await.unwrap().unwrap().status, ItemStatus::Completed);
        assert_eq!(queue.get(bad.id).await.unwrap().unwrap().status, ItemStatus::Failed);
        let names: Vec<String> = worker.jobs().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["queue-processor", "queue-prune"]);
        assert!(worker.shutdown().await);
    }

    #[tokio::test]
    async fn two_workers_share_the_queue() {
        let locks = InMemoryLockTable::new();
        let queue = InMemoryQueueStore::arc();
        let state = InMemoryStateStore::arc();

        let start = |name: &str| {
            let mut app = WorkerApp::new(config(name));
            app.register_fn("noop", |_item, _cancel| async { Ok(()) });
            app.start(Backends::in_memory(state.clone(), queue.clone(), &locks))
        };
        let a = start("worker-a");
        let b = start("worker-b");

        for _ in 0..50 {
            a.queue()
                .enqueue(NewItem::new("noop", serde_json::Value::Null))
                .await
                .unwrap();
        }

        wait_for(|| a.processor_stats().completed + b.processor_stats().completed == 50).await;
        assert_eq!(queue.stats().await.unwrap().completed, 50);

        // Pausing the processor fleet-wide.
        state
            .set_worker_disabled(QueueProcessorJob::NAME, true)
            .await
            .unwrap();
        let paused = a
            .queue()
            .enqueue(NewItem::new("noop", serde_json::Value::Null))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get(paused.id).await.unwrap().unwrap().status, ItemStatus::Pending);

        assert!(a.shutdown().await);
        assert!(b.shutdown().await);
    }
}
