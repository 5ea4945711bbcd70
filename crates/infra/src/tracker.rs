//! Tracking records for long-running external sub-jobs.
//!
//! A job that starts work elsewhere (a provider-side batch, an export) records
//! it under `<prefix>.<job_id>` so that whichever instance runs next can poll
//! it, and removes the record once the work finishes. Records nobody touched
//! for too long are swept as abandoned.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tidepool_core::{Clock, LockId, SystemClock, keys, to_chrono};

use crate::guard::{JobSpec, RecurringJob};
use crate::state_store::{StateStore, StateStoreError, StateStoreExt};

/// Persisted form of one tracked sub-job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord<T> {
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: T,
}

/// Only the timestamp, for sweeping records of any payload type.
#[derive(Deserialize)]
struct Stamp {
    updated_at: DateTime<Utc>,
}

/// Typed view over the records under one prefix.
pub struct TrackedJobs<T> {
    store: Arc<dyn StateStore>,
    prefix: String,
    clock: Arc<dyn Clock>,
    _data: PhantomData<fn() -> T>,
}

impl<T> Clone for TrackedJobs<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            clock: self.clock.clone(),
            _data: PhantomData,
        }
    }
}

impl<T> TrackedJobs<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            clock: Arc::new(SystemClock),
            _data: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, job_id: &str) -> Result<String, StateStoreError> {
        let key = keys::tracked(&self.prefix, job_id);
        if job_id.trim().is_empty() {
            return Err(StateStoreError::invalid(&key, "tracked job id must not be empty"));
        }
        Ok(key)
    }

    /// Start tracking `job_id`, replacing any earlier record for it.
    pub async fn track(&self, job_id: &str, data: T) -> Result<TrackedRecord<T>, StateStoreError> {
        let key = self.key(job_id)?;
        let now = self.clock.now();
        let record = TrackedRecord {
            started_at: now,
            updated_at: now,
            data,
        };
        self.store.set_json(&key, &record).await?;
        Ok(record)
    }

    /// Refresh `updated_at`, optionally replacing the payload.
    ///
    /// Returns `Ok(None)` if `job_id` is not tracked.
    pub async fn touch(
        &self,
        job_id: &str,
        data: Option<T>,
    ) -> Result<Option<TrackedRecord<T>>, StateStoreError> {
        let key = self.key(job_id)?;
        let Some(mut record) = self.get(job_id).await? else {
            return Ok(None);
        };
        record.updated_at = self.clock.now();
        if let Some(data) = data {
            record.data = data;
        }
        self.store.set_json(&key, &record).await?;
        Ok(Some(record))
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<TrackedRecord<T>>, StateStoreError> {
        let key = self.key(job_id)?;
        match self.store.get_json(&key).await {
            Ok(record) => Ok(Some(record)),
            Err(StateStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All readable records, by job id. Unreadable rows are skipped.
    pub async fn list(&self) -> Result<Vec<(String, TrackedRecord<T>)>, StateStoreError> {
        let prefix = keys::tracked_prefix(&self.prefix);
        let rows = self.store.list_by_prefix(&prefix).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let job_id = row.key[prefix.len()..].to_string();
            match serde_json::from_str::<TrackedRecord<T>>(&row.value) {
                Ok(record) => out.push((job_id, record)),
                Err(e) => warn!(key = %row.key, error = %e, "skipping unreadable tracking record"),
            }
        }
        Ok(out)
    }

    /// Stop tracking `job_id`. Finishing an unknown id is not an error.
    pub async fn finish(&self, job_id: &str) -> Result<(), StateStoreError> {
        let key = self.key(job_id)?;
        self.store.remove(&key).await
    }

    /// Remove records not updated within `max_age`; returns the removed ids.
    ///
    /// A record whose body cannot be read ages by its row timestamp instead.
    pub async fn sweep_abandoned(&self, max_age: Duration) -> Result<Vec<String>, StateStoreError> {
        let prefix = keys::tracked_prefix(&self.prefix);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(to_chrono(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed = Vec::new();
        for row in self.store.list_by_prefix(&prefix).await? {
            let updated_at = serde_json::from_str::<Stamp>(&row.value)
                .map(|s| s.updated_at)
                .unwrap_or(row.updated_at);
            if updated_at < cutoff {
                self.store.remove(&row.key).await?;
                removed.push(row.key[prefix.len()..].to_string());
            }
        }

        if !removed.is_empty() {
            warn!(
                prefix = %self.prefix,
                count = removed.len(),
                ids = ?removed,
                "removed abandoned tracking records"
            );
        }
        Ok(removed)
    }
}

/// Recurring job sweeping abandoned records under a set of prefixes.
pub struct TrackedJobSweeper {
    spec: JobSpec,
    trackers: Vec<TrackedJobs<serde_json::Value>>,
    max_age: Duration,
}

impl TrackedJobSweeper {
    pub const NAME: &'static str = "tracked-job-sweeper";
    pub const LOCK_ID: LockId = LockId::new(0x7470_0002);

    pub fn new(
        store: Arc<dyn StateStore>,
        prefixes: impl IntoIterator<Item = String>,
        max_age: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            spec: JobSpec::new(Self::NAME, interval).with_lock(Self::LOCK_ID),
            trackers: prefixes
                .into_iter()
                .map(|p| TrackedJobs::new(store.clone(), p))
                .collect(),
            max_age,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.trackers = self
            .trackers
            .into_iter()
            .map(|t| t.with_clock(clock.clone()))
            .collect();
        self
    }
}

#[async_trait::async_trait]
impl RecurringJob for TrackedJobSweeper {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut total = 0;
        for tracker in &self.trackers {
            if cancel.is_cancelled() {
                break;
            }
            total += tracker.sweep_abandoned(self.max_age).await?.len();
        }
        if total > 0 {
            info!(removed = total, "tracked job sweep finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tidepool_core::ManualClock;

    use crate::state_store::InMemoryStateStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Batch {
        provider_id: String,
        items: u32,
    }

    fn setup() -> (Arc<InMemoryStateStore>, TrackedJobs<Batch>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(InMemoryStateStore::with_clock(Arc::new(clock.clone())));
        let tracker =
            TrackedJobs::new(store.clone(), "ai.batch").with_clock(Arc::new(clock.clone()));
        (store, tracker, clock)
    }

    fn batch(id: &str) -> Batch {
        Batch {
            provider_id: id.to_string(),
            items: 10,
        }
    }

    #[tokio::test]
    async fn track_get_finish() {
        let (store, tracker, _clock) = setup();
        tracker.track("b-1", batch("p-1")).await.unwrap();

        let raw = store.get("ai.batch.b-1").await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json.get("started_at").is_some());
        assert_eq!(json["data"]["provider_id"], "p-1");

        let record = tracker.get("b-1").await.unwrap().unwrap();
        assert_eq!(record.data, batch("p-1"));

        tracker.finish("b-1").await.unwrap();
        assert!(tracker.get("b-1").await.unwrap().is_none());
        tracker.finish("b-1").await.unwrap();
    }

    #[tokio::test]
    async fn touch_refreshes_and_replaces() {
        let (_store, tracker, clock) = setup();
        let started = tracker.track("b-1", batch("p-1")).await.unwrap();
        clock.advance(ChronoDuration::minutes(5));

        let touched = tracker
            .touch("b-1", Some(batch("p-2")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.started_at, started.started_at);
        assert_eq!(touched.updated_at, clock.now());
        assert_eq!(touched.data.provider_id, "p-2");

        assert!(tracker.touch("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let (store, tracker, _clock) = setup();
        tracker.track("b-1", batch("p-1")).await.unwrap();
        tracker.track("b-2", batch("p-2")).await.unwrap();
        store.set("ai.batchx.other", "{}").await.unwrap();
        store.set("ai.batch.garbage", "not json").await.unwrap();

        let ids: Vec<String> = tracker
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["b-1", "b-2"]);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_records() {
        let (store, tracker, clock) = setup();
        tracker.track("old", batch("p-1")).await.unwrap();
        store.set("ai.batch.garbage", "not json").await.unwrap();
        clock.advance(ChronoDuration::hours(25));
        tracker.track("fresh", batch("p-2")).await.unwrap();

        let mut removed = tracker.sweep_abandoned(Duration::from_secs(86_400)).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["garbage", "old"]);
        assert!(tracker.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_job_id_is_rejected() {
        let (_store, tracker, _clock) = setup();
        assert!(tracker.track(" ", batch("p")).await.is_err());
    }

    #[tokio::test]
    async fn sweeper_job_covers_every_prefix() {
        let clock = ManualClock::new(Utc::now());
        let store: Arc<dyn StateStore> =
            Arc::new(InMemoryStateStore::with_clock(Arc::new(clock.clone())));
        let a: TrackedJobs<Batch> =
            TrackedJobs::new(store.clone(), "a").with_clock(Arc::new(clock.clone()));
        let b: TrackedJobs<Batch> =
            TrackedJobs::new(store.clone(), "b").with_clock(Arc::new(clock.clone()));
        a.track("1", batch("x")).await.unwrap();
        b.track("2", batch("y")).await.unwrap();
        clock.advance(ChronoDuration::hours(2));

        let sweeper = TrackedJobSweeper::new(
            store.clone(),
            ["a".to_string(), "b".to_string()],
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .with_clock(Arc::new(clock.clone()));
        sweeper.run(&CancellationToken::new()).await.unwrap();

        assert!(a.list().await.unwrap().is_empty());
        assert!(b.list().await.unwrap().is_empty());
    }
}
