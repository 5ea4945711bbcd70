//! Postgres backend tests.
//!
//! Run against a disposable database:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/tidepool_test cargo test -p tidepool-infra --test postgres
//! ```
//!
//! Without `DATABASE_URL` every test returns immediately. The queue test
//! truncates `queue_items`, so never point this at a shared database.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::layer::{Context, SubscriberExt};

use tidepool_core::{FailOutcome, FailureKind, ItemStatus, LockId, NewItem, WorkerId};
use tidepool_infra::lock::PostgresAdvisoryLock;
use tidepool_infra::queue::PostgresQueueStore;
use tidepool_infra::state_store::PostgresStateStore;
use tidepool_infra::{
    AdvisoryLock, QueueStore, QueueStoreError, StateStore, StateStoreExt, ensure_schema,
};

async fn pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    ensure_schema(&pool).await.expect("create schema");
    Some(pool)
}

/// Counts ERROR events seen by the thread-local subscriber.
#[derive(Clone, Default)]
struct ErrorEvents(Arc<AtomicUsize>);

impl ErrorEvents {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorEvents {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7().simple())
}

#[tokio::test]
async fn missing_keys_are_not_logged_as_errors() {
    let Some(pool) = pool().await else { return };
    let store = PostgresStateStore::new(pool);
    let name = unique("quiet");

    let errors = ErrorEvents::default();
    let _subscriber = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(errors.clone()),
    );

    assert!(!store.is_worker_disabled(&name).await.unwrap());
    let missing = store.get_time(&format!("{name}.next_run_at")).await;
    assert!(missing.is_err_and(|e| e.is_absent()));

    assert_eq!(errors.count(), 0);
}

#[tokio::test]
async fn state_store_upserts_and_lists_by_prefix() {
    let Some(pool) = pool().await else { return };
    let store = PostgresStateStore::new(pool);
    let ns = unique("test");

    store.set(&format!("{ns}.a"), "1").await.unwrap();
    store.set(&format!("{ns}.a"), "2").await.unwrap();
    store.set(&format!("{ns}.b"), "3").await.unwrap();
    store.set(&format!("{ns}x.c"), "4").await.unwrap();

    assert_eq!(store.get(&format!("{ns}.a")).await.unwrap(), "2");
    let rows = store.list_by_prefix(&format!("{ns}.")).await.unwrap();
    let keys: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, vec![format!("{ns}.a"), format!("{ns}.b")]);

    store.remove(&format!("{ns}.a")).await.unwrap();
    store.remove(&format!("{ns}.a")).await.unwrap();
    assert!(store.get(&format!("{ns}.a")).await.unwrap_err().is_absent());

    let name = unique("job");
    assert!(!store.is_worker_disabled(&name).await.unwrap());
    store.set_worker_disabled(&name, true).await.unwrap();
    assert!(store.is_worker_disabled(&name).await.unwrap());

    for key in [format!("{ns}.b"), format!("{ns}x.c"), format!("worker.{name}.disabled")] {
        store.remove(&key).await.unwrap();
    }
}

#[tokio::test]
async fn advisory_lock_is_exclusive_across_sessions() {
    let Some(pool) = pool().await else { return };
    let id = LockId::new(i64::from(std::process::id()) << 16 | 0x51);
    let a = PostgresAdvisoryLock::new(pool.clone());
    let b = PostgresAdvisoryLock::new(pool.clone());

    assert!(a.try_lock(id).await.unwrap());
    assert!(!a.try_lock(id).await.unwrap());
    assert!(!b.try_lock(id).await.unwrap());

    a.release_lock(id).await.unwrap();
    assert!(b.try_lock(id).await.unwrap());
    b.release_lock(id).await.unwrap();
    b.release_lock(id).await.unwrap();
    assert!(b.held_ids().is_empty());
}

#[tokio::test]
async fn queue_lifecycle() {
    let Some(pool) = pool().await else { return };
    sqlx::query("TRUNCATE queue_items").execute(&pool).await.unwrap();
    let store = Arc::new(PostgresQueueStore::new(pool.clone()));
    let stale = Duration::from_secs(900);
    let w = WorkerId::new("pg-worker").unwrap();

    // Complete / ownership.
    let item = store.enqueue(NewItem::new("t", serde_json::json!({"k": 1}))).await.unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    let claimed = store.claim_next(&w, stale).await.unwrap().unwrap();
    assert_eq!(claimed.id, item.id);
    assert_eq!(claimed.payload["k"], 1);
    let other = WorkerId::new("someone-else").unwrap();
    assert!(matches!(
        store.complete(item.id, &other).await,
        Err(QueueStoreError::ClaimLost(_))
    ));
    store.complete(item.id, &w).await.unwrap();
    assert!(store.claim_next(&w, stale).await.unwrap().is_none());

    // Retry then dead-letter.
    let item = store
        .enqueue(NewItem::new("t", serde_json::json!({})).with_max_retries(1))
        .await
        .unwrap();
    store.claim_next(&w, stale).await.unwrap().unwrap();
    let out = store
        .fail(item.id, &w, "boom", Duration::ZERO, FailureKind::Retriable)
        .await
        .unwrap();
    assert!(matches!(out, FailOutcome::Retrying { retry_count: 1, .. }));
    store.claim_next(&w, stale).await.unwrap().unwrap();
    let out = store
        .fail(item.id, &w, "boom again", Duration::ZERO, FailureKind::Retriable)
        .await
        .unwrap();
    assert_eq!(out, FailOutcome::DeadLettered { retry_count: 1 });
    let dead = store.list_by_status(ItemStatus::Failed, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom again"));

    // Requeue.
    assert!(matches!(
        store.requeue(dead[0].id).await.unwrap().status,
        ItemStatus::Pending
    ));
    let again = store.claim_next(&w, stale).await.unwrap().unwrap();
    store.complete(again.id, &w).await.unwrap();

    // Stale claim recovery with a zero window.
    let item = store.enqueue(NewItem::new("t", serde_json::json!({}))).await.unwrap();
    store.claim_next(&other, stale).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let rescued = store
        .claim_next(&w, Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rescued.id, item.id);
    assert_eq!(rescued.retry_count, 1);
    store.complete(item.id, &w).await.unwrap();

    // Concurrent claimers never share an item.
    const ITEMS: usize = 100;
    for i in 0..ITEMS {
        store.enqueue(NewItem::new("t", serde_json::json!({ "i": i }))).await.unwrap();
    }
    let mut tasks = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let w = WorkerId::new(format!("claimer-{n}")).unwrap();
            let mut mine = Vec::new();
            while let Some(item) = store.claim_next(&w, Duration::from_secs(900)).await.unwrap() {
                mine.push(item.id);
            }
            mine
        }));
    }
    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), ITEMS);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processing, ITEMS as u64);
    assert_eq!(stats.completed, 3);

    let pruned = store
        .prune_completed(chrono::Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(pruned, 3);
}
