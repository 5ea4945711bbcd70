use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tidepool_core::LockId;

use super::r#trait::{AdvisoryLock, LockError};

/// Shared lock table standing in for the backing store.
///
/// Every simulated process opens its own [`InMemoryLockSession`]; dropping a
/// session without releasing behaves like a crashed connection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockTable {
    holders: Arc<Mutex<HashMap<LockId, u64>>>,
    next_session: Arc<AtomicU64>,
}

impl InMemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> InMemoryLockSession {
        InMemoryLockSession {
            table: self.clone(),
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed) + 1,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Session id currently holding `id`, if any.
    pub fn holder(&self, id: LockId) -> Option<u64> {
        self.holders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .copied()
    }

    pub fn is_locked(&self, id: LockId) -> bool {
        self.holder(id).is_some()
    }
}

/// One session on an [`InMemoryLockTable`].
#[derive(Debug)]
pub struct InMemoryLockSession {
    table: InMemoryLockTable,
    session_id: u64,
    unavailable: AtomicBool,
}

impl InMemoryLockSession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Make every call fail, as an unreachable backend would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Backend("lock backend unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdvisoryLock for InMemoryLockSession {
    async fn try_lock(&self, id: LockId) -> Result<bool, LockError> {
        self.check_available()?;
        let mut holders = self
            .table
            .holders
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        // Re-entry from the holding session is contention too: every job of a
        // process shares one session.
        if holders.contains_key(&id) {
            return Ok(false);
        }
        holders.insert(id, self.session_id);
        Ok(true)
    }

    async fn release_lock(&self, id: LockId) -> Result<(), LockError> {
        self.check_available()?;
        let mut holders = self
            .table
            .holders
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        if holders.get(&id) == Some(&self.session_id) {
            holders.remove(&id);
        }
        Ok(())
    }
}

impl Drop for InMemoryLockSession {
    fn drop(&mut self) {
        let mut holders = self
            .table
            .holders
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        holders.retain(|_, holder| *holder != self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: LockId = LockId::new(4201);

    #[tokio::test]
    async fn second_session_is_refused_until_release() {
        let table = InMemoryLockTable::new();
        let a = table.session();
        let b = table.session();

        assert!(a.try_lock(JOB).await.unwrap());
        assert!(!b.try_lock(JOB).await.unwrap());

        a.release_lock(JOB).await.unwrap();
        assert!(b.try_lock(JOB).await.unwrap());
    }

    #[tokio::test]
    async fn holding_session_cannot_take_the_lock_twice() {
        let table = InMemoryLockTable::new();
        let session = table.session();

        assert!(session.try_lock(JOB).await.unwrap());
        assert!(!session.try_lock(JOB).await.unwrap());

        // The refused attempt left the first acquisition intact.
        assert_eq!(table.holder(JOB), Some(session.session_id()));
        session.release_lock(JOB).await.unwrap();
        assert!(session.try_lock(JOB).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_scoped_to_the_session() {
        let table = InMemoryLockTable::new();
        let a = table.session();
        let b = table.session();

        // Never acquired: no-op.
        a.release_lock(JOB).await.unwrap();

        assert!(a.try_lock(JOB).await.unwrap());
        // Someone else's lock: no-op.
        b.release_lock(JOB).await.unwrap();
        assert_eq!(table.holder(JOB), Some(a.session_id()));

        a.release_lock(JOB).await.unwrap();
        a.release_lock(JOB).await.unwrap();
        assert!(!table.is_locked(JOB));
    }

    #[tokio::test]
    async fn dropped_session_releases_its_locks() {
        let table = InMemoryLockTable::new();
        let crashed = table.session();
        assert!(crashed.try_lock(JOB).await.unwrap());
        assert!(crashed.try_lock(LockId::new(7)).await.unwrap());

        drop(crashed);

        let survivor = table.session();
        assert!(survivor.try_lock(JOB).await.unwrap());
        assert!(survivor.try_lock(LockId::new(7)).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_ids_do_not_contend() {
        let table = InMemoryLockTable::new();
        let a = table.session();
        let b = table.session();

        assert!(a.try_lock(LockId::new(1)).await.unwrap());
        assert!(b.try_lock(LockId::new(2)).await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_backend_errors() {
        let table = InMemoryLockTable::new();
        let a = table.session();
        a.set_unavailable(true);
        assert!(matches!(a.try_lock(JOB).await, Err(LockError::Backend(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_contenders_get_one_winner() {
        let table = InMemoryLockTable::new();
        let mut tasks = Vec::new();
        let mut sessions = Vec::new();
        for _ in 0..16 {
            sessions.push(Arc::new(table.session()));
        }
        for s in &sessions {
            let s = s.clone();
            tasks.push(tokio::spawn(async move { s.try_lock(JOB).await.unwrap() }));
        }

        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
