use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use tidepool_core::LockId;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),

    /// The session carrying the locks went away; every lock it held is gone.
    #[error("lock session lost: {0}")]
    SessionLost(String),
}

/// Session-scoped, non-blocking mutual exclusion keyed by a small integer.
///
/// - `try_lock` never waits: contention is an immediate `Ok(false)`.
/// - `release_lock` is idempotent and a no-op for locks this session does not
///   hold.
/// - Locks live as long as the session (connection) that took them. When the
///   session ends, including by a crash, the backing store drops its locks;
///   there is no TTL or heartbeat here.
#[async_trait::async_trait]
pub trait AdvisoryLock: Send + Sync {
    async fn try_lock(&self, id: LockId) -> Result<bool, LockError>;

    async fn release_lock(&self, id: LockId) -> Result<(), LockError>;
}

#[async_trait::async_trait]
impl<L: AdvisoryLock + ?Sized> AdvisoryLock for Arc<L> {
    async fn try_lock(&self, id: LockId) -> Result<bool, LockError> {
        (**self).try_lock(id).await
    }

    async fn release_lock(&self, id: LockId) -> Result<(), LockError> {
        (**self).release_lock(id).await
    }
}

/// An acquired lock that is released on every exit path.
///
/// Call [`LockLease::release`] on the normal path. If the lease is dropped
/// without it (a panic unwinding, or the owning future being cancelled), the
/// release is spawned onto the current tokio runtime.
pub struct LockLease {
    lock: Arc<dyn AdvisoryLock>,
    id: LockId,
    released: bool,
}

impl LockLease {
    /// `Ok(None)` when another session holds `id`.
    pub async fn try_acquire(
        lock: Arc<dyn AdvisoryLock>,
        id: LockId,
    ) -> Result<Option<LockLease>, LockError> {
        if lock.try_lock(id).await? {
            Ok(Some(LockLease {
                lock,
                id,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        let res = self.lock.release_lock(self.id).await;
        self.released = true;
        res
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let lock = self.lock.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release_lock(id).await {
                        warn!(lock_id = %id, error = %e, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_id = %id,
                    "lock lease dropped outside a runtime; held until session ends"
                );
            }
        }
    }
}

impl core::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockLease")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
