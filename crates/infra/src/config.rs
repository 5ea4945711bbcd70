//! Worker configuration from `TIDEPOOL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tidepool_core::{BackoffPolicy, WorkerId};

use crate::queue::ProcessorConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime configuration of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub worker_id: WorkerId,
    pub db_max_connections: u32,
    pub backoff_base: u64,
    pub processor_interval: Duration,
    pub processor_batch: usize,
    pub stale_claim_after: Duration,
    /// Prefixes swept by the tracked-job sweeper.
    pub tracked_prefixes: Vec<String>,
    pub tracked_max_age: Duration,
    pub completed_retention: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: WorkerId::generate(&default_host()),
            db_max_connections: 10,
            backoff_base: 4,
            processor_interval: Duration::from_millis(1000),
            processor_batch: 16,
            stale_claim_after: Duration::from_secs(900),
            tracked_prefixes: Vec::new(),
            tracked_max_age: Duration::from_secs(86_400),
            completed_retention: Duration::from_secs(604_800),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}

impl WorkerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        cfg.database_url = get("DATABASE_URL");
        if let Some(id) = get("TIDEPOOL_WORKER_ID") {
            cfg.worker_id = WorkerId::new(id.trim()).map_err(|e| ConfigError::Invalid {
                var: "TIDEPOOL_WORKER_ID",
                reason: e.to_string(),
            })?;
        }
        if let Some(n) = parse(&get, "TIDEPOOL_DB_MAX_CONNECTIONS")? {
            cfg.db_max_connections = positive("TIDEPOOL_DB_MAX_CONNECTIONS", n)?;
        }
        if let Some(base) = parse(&get, "TIDEPOOL_BACKOFF_BASE")? {
            cfg.backoff_base = positive("TIDEPOOL_BACKOFF_BASE", base)?;
        }
        if let Some(ms) = parse::<u64, _>(&get, "TIDEPOOL_PROCESSOR_INTERVAL_MS")? {
            cfg.processor_interval =
                Duration::from_millis(positive("TIDEPOOL_PROCESSOR_INTERVAL_MS", ms)?);
        }
        if let Some(n) = parse(&get, "TIDEPOOL_PROCESSOR_BATCH")? {
            cfg.processor_batch = positive("TIDEPOOL_PROCESSOR_BATCH", n)?;
        }
        if let Some(secs) = parse(&get, "TIDEPOOL_STALE_CLAIM_SECS")? {
            cfg.stale_claim_after =
                Duration::from_secs(positive("TIDEPOOL_STALE_CLAIM_SECS", secs)?);
        }
        if let Some(list) = get("TIDEPOOL_TRACKED_PREFIXES") {
            cfg.tracked_prefixes = list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = parse(&get, "TIDEPOOL_TRACKED_MAX_AGE_SECS")? {
            cfg.tracked_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, "TIDEPOOL_COMPLETED_RETENTION_SECS")? {
            cfg.completed_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&get, "TIDEPOOL_SHUTDOWN_GRACE_SECS")? {
            cfg.shutdown_grace = Duration::from_secs(secs);
        }

        Ok(cfg)
    }

    /// `DATABASE_URL`, required by the Postgres-backed binary.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_backoff_base(mut self, base: u64) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_processor_interval(mut self, interval: Duration) -> Self {
        self.processor_interval = interval;
        self
    }

    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = after;
        self
    }

    pub fn with_tracked_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tracked_prefixes.push(prefix.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            backoff: BackoffPolicy::new(self.backoff_base),
            stale_after: self.stale_claim_after,
            batch_size: self.processor_batch,
        }
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}

fn positive<T>(var: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        })
    }
}
