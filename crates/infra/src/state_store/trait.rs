use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use tidepool_core::keys;

/// One persisted runtime-state row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// State store operation error.
///
/// `NotFound` and `InvalidFormat` are both "no usable value"; scheduling code
/// treats them the same way (fail open, assume the job never ran). Use
/// [`StateStoreError::is_absent`] for that check.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("runtime state key not found: {0}")]
    NotFound(String),

    #[error("invalid value for runtime state key '{key}': {reason}")]
    InvalidFormat { key: String, reason: String },

    #[error("state store error: {0}")]
    Storage(String),
}

impl StateStoreError {
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            StateStoreError::NotFound(_) | StateStoreError::InvalidFormat { .. }
        )
    }

    pub(crate) fn invalid(key: &str, reason: impl core::fmt::Display) -> Self {
        StateStoreError::InvalidFormat {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Persisted key/value store shared by every instance of every job.
///
/// Writes are idempotent upserts; there is at most one row per key. All
/// mutations are serialized by the backing store. Operations are async, so a
/// caller abandons one by dropping its future.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String, StateStoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StateStoreError>;

    /// All rows whose key starts with `prefix`, ordered by key.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<RuntimeState>, StateStoreError>;

    /// Delete a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StateStoreError>;
}

#[async_trait::async_trait]
impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<String, StateStoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        (**self).set(key, value).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<RuntimeState>, StateStoreError> {
        (**self).list_by_prefix(prefix).await
    }

    async fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        (**self).remove(key).await
    }
}

/// Text form of timestamps in the state store (RFC 3339, UTC, microseconds).
pub fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(key: &str, value: &str) -> Result<DateTime<Utc>, StateStoreError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateStoreError::invalid(key, e))
}

/// Typed helpers over any [`StateStore`].
#[async_trait::async_trait]
pub trait StateStoreExt: StateStore {
    async fn get_time(&self, key: &str) -> Result<DateTime<Utc>, StateStoreError> {
        let raw = self.get(key).await?;
        parse_time(key, &raw)
    }

    async fn set_time(&self, key: &str, at: DateTime<Utc>) -> Result<(), StateStoreError> {
        self.set(key, &format_time(at)).await
    }

    async fn get_json<T>(&self, key: &str) -> Result<T, StateStoreError>
    where
        T: DeserializeOwned + Send,
    {
        let raw = self.get(key).await?;
        serde_json::from_str(&raw).map_err(|e| StateStoreError::invalid(key, e))
    }

    async fn set_json<T>(&self, key: &str, value: &T) -> Result<(), StateStoreError>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value).map_err(|e| StateStoreError::invalid(key, e))?;
        self.set(key, &raw).await
    }

    /// Whether the kill switch of the recurring job `name` is on.
    ///
    /// A missing key means enabled.
    async fn is_worker_disabled(&self, name: &str) -> Result<bool, StateStoreError> {
        match self.get(&keys::worker_disabled(name)).await {
            Ok(v) => Ok(v.trim().eq_ignore_ascii_case("true")),
            Err(StateStoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn set_worker_disabled(&self, name: &str, disabled: bool) -> Result<(), StateStoreError> {
        let value = if disabled { "true" } else { "false" };
        self.set(&keys::worker_disabled(name), value).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}
