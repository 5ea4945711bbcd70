//! Postgres session-level advisory locks.
//!
//! `pg_try_advisory_lock(bigint)` on one dedicated connection. The connection
//! is detached from the pool, so when it is dropped (error, shutdown, crash)
//! the socket closes and Postgres drops every lock the session held. Pooled
//! connections would hand the session to unrelated queries and keep locks
//! alive after we stop caring about them.
//!
//! Postgres advisory locks are re-entrant per session, but all jobs of this
//! process share the one session here. A local `held` set makes a second
//! in-process `try_lock` on the same id report contention instead of silently
//! stacking a second acquisition.
//!
//! The shared session is also a shared failure domain. When a lock call fails
//! at the transport level the session is discarded, which releases every lock
//! of the process, not just the one being called. Runs already in progress
//! under the other locks are not interrupted; they finish without fleet
//! exclusivity and the discarded ids are logged at `warn`. The next
//! `try_lock` opens a fresh session.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;

use sqlx::{Connection, PgConnection, PgPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use tidepool_core::LockId;

use super::r#trait::{AdvisoryLock, LockError};

pub struct PostgresAdvisoryLock {
    pool: PgPool,
    session: Mutex<Option<PgConnection>>,
    held: StdMutex<HashSet<LockId>>,
}

impl PostgresAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: Mutex::new(None),
            held: StdMutex::new(HashSet::new()),
        }
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<LockId>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Ids this process believes it holds.
    pub fn held_ids(&self) -> Vec<LockId> {
        let mut ids: Vec<LockId> = self.held().iter().copied().collect();
        ids.sort();
        ids
    }

    /// Drop the session after a failure. Postgres releases its locks.
    async fn discard_session(&self, slot: &mut Option<PgConnection>) {
        if let Some(conn) = slot.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "closing broken lock session failed");
            }
        }
        let abandoned = take_abandoned(&mut self.held());
        if !abandoned.is_empty() {
            warn!(
                lock_ids = ?abandoned,
                "lock session discarded; runs holding these locks are no longer exclusive"
            );
        }
    }

    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<PgConnection>,
    ) -> Result<&'a mut PgConnection, LockError> {
        if slot.is_none() {
            let conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| LockError::Backend(format!("acquire lock session: {e}")))?
                .detach();
            *slot = Some(conn);
        }
        slot.as_mut()
            .ok_or_else(|| LockError::SessionLost("lock session unavailable".to_string()))
    }
}

#[async_trait::async_trait]
impl AdvisoryLock for PostgresAdvisoryLock {
    #[instrument(skip(self), fields(lock_id = id.get()), err(level = "warn"))]
    async fn try_lock(&self, id: LockId) -> Result<bool, LockError> {
        let mut slot = self.session.lock().await;
        if self.held().contains(&id) {
            return Ok(false);
        }
        let conn = self.ensure_session(&mut slot).await?;

        let result = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(id.get())
            .fetch_one(&mut *conn)
            .await
            .and_then(|row| row.try_get::<bool, _>("acquired"));

        match result {
            Ok(true) => {
                self.held().insert(id);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                warn!(lock_id = %id, error = %e, "advisory lock session failed; discarding it");
                self.discard_session(&mut slot).await;
                Err(LockError::SessionLost(format!("pg_try_advisory_lock: {e}")))
            }
        }
    }

    #[instrument(skip(self), fields(lock_id = id.get()), err(level = "warn"))]
    async fn release_lock(&self, id: LockId) -> Result<(), LockError> {
        let mut slot = self.session.lock().await;
        if !self.held().remove(&id) {
            return Ok(());
        }
        let Some(conn) = slot.as_mut() else {
            // Session already gone, and its locks with it.
            return Ok(());
        };

        let result = sqlx::query("SELECT pg_advisory_unlock($1) AS released")
            .bind(id.get())
            .fetch_one(&mut *conn)
            .await
            .and_then(|row| row.try_get::<bool, _>("released"));

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(lock_id = %id, "advisory unlock found no lock held by this session");
                Ok(())
            }
            Err(e) => {
                warn!(lock_id = %id, error = %e, "advisory unlock failed; discarding session");
                self.discard_session(&mut slot).await;
                Err(LockError::SessionLost(format!("pg_advisory_unlock: {e}")))
            }
        }
    }
}

/// Empty the local `held` set, returning the ids it had, sorted.
fn take_abandoned(held: &mut HashSet<LockId>) -> Vec<i64> {
    let mut ids: Vec<i64> = held.drain().map(LockId::get).collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discarding_reports_every_held_lock() {
        let mut held: HashSet<LockId> = [LockId::new(30), LockId::new(4), LockId::new(12)]
            .into_iter()
            .collect();

        assert_eq!(take_abandoned(&mut held), vec![4, 12, 30]);
        assert!(held.is_empty());
        assert!(take_abandoned(&mut held).is_empty());
    }
}
