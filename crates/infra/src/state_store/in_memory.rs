use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use tidepool_core::{Clock, SystemClock};

use super::r#trait::{RuntimeState, StateStore, StateStoreError};

/// In-memory runtime state.
///
/// Intended for tests/dev. Share one instance (behind an `Arc`) between
/// simulated instances to model a shared backing store.
pub struct InMemoryStateStore {
    rows: RwLock<BTreeMap<String, (String, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StateStoreError {
    StateStoreError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<String, StateStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        rows.get(key)
            .map(|(v, _)| v.clone())
            .ok_or_else(|| StateStoreError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        rows.insert(key.to_string(), (value.to_string(), now));
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<RuntimeState>, StateStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, at))| RuntimeState {
                key: k.clone(),
                value: v.clone(),
                updated_at: *at,
            })
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        rows.remove(key);
        Ok(())
    }
}
