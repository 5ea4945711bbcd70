//! Postgres-backed queue.
//!
//! Table `queue_items`, created by [`crate::schema::ensure_schema`]. All
//! timestamps come from the database clock (`NOW()`), so instances with skewed
//! wall clocks still agree on availability and staleness.
//!
//! Claiming is one `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement: concurrent claimers skip rows another transaction holds, so a row
//! is handed to exactly one of them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use tidepool_core::{
    CLAIM_EXPIRED, FailOutcome, FailureKind, ItemId, ItemStatus, NewItem, QueueItem, WorkerId,
};

use super::store::{QueueStats, QueueStore, QueueStoreError};

const COLUMNS: &str = "id, item_type, payload, status, retry_count, max_retries, \
                       claimed_by, claimed_at, available_at, last_error, created_at, updated_at";

/// Upper bound for a backoff handed to SQL; beyond this `NOW() + interval`
/// would leave the timestamp range.
const MAX_BACKOFF_SECS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn exists(&self, id: ItemId, operation: &str) -> Result<bool, QueueStoreError> {
        let row = sqlx::query("SELECT 1 FROM queue_items WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(row.is_some())
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, QueueStoreError> {
    i32::try_from(value).map_err(|_| QueueStoreError::Invalid(format!("{field} out of range")))
}

fn seconds(d: Duration) -> f64 {
    d.as_secs_f64().min(MAX_BACKOFF_SECS)
}

fn row_to_item(row: &PgRow) -> Result<QueueItem, QueueStoreError> {
    let op = "decode";
    let status: String = row.try_get("status").map_err(|e| map_sqlx_error(op, e))?;
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(|e| map_sqlx_error(op, e))?;
    let retry_count: i32 = row.try_get("retry_count").map_err(|e| map_sqlx_error(op, e))?;
    let max_retries: i32 = row.try_get("max_retries").map_err(|e| map_sqlx_error(op, e))?;

    Ok(QueueItem {
        id: ItemId::from_uuid(row.try_get("id").map_err(|e| map_sqlx_error(op, e))?),
        item_type: row.try_get("item_type").map_err(|e| map_sqlx_error(op, e))?,
        payload: row.try_get("payload").map_err(|e| map_sqlx_error(op, e))?,
        status: status
            .parse::<ItemStatus>()
            .map_err(|e| QueueStoreError::Storage(e.to_string()))?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        claimed_by: claimed_by
            .map(WorkerId::new)
            .transpose()
            .map_err(|e| QueueStoreError::Storage(e.to_string()))?,
        claimed_at: row.try_get("claimed_at").map_err(|e| map_sqlx_error(op, e))?,
        available_at: row.try_get("available_at").map_err(|e| map_sqlx_error(op, e))?,
        last_error: row.try_get("last_error").map_err(|e| map_sqlx_error(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| map_sqlx_error(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| map_sqlx_error(op, e))?,
    })
}

#[async_trait::async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, item), fields(item_type = %item.item_type), err)]
    async fn enqueue(&self, item: NewItem) -> Result<QueueItem, QueueStoreError> {
        item.validate()?;
        let id = ItemId::new();
        let sql = format!(
            r#"
            INSERT INTO queue_items
                (id, item_type, payload, status, retry_count, max_retries,
                 available_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, COALESCE($5, NOW()), NOW(), NOW())
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(&item.item_type)
            .bind(&item.payload)
            .bind(to_i32(item.max_retries, "max_retries")?)
            .bind(item.available_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        row_to_item(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(row_to_item).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        stale_after: Duration,
    ) -> Result<Option<QueueItem>, QueueStoreError> {
        let stale_secs = stale_after.as_secs_f64();

        let swept = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))
              AND retry_count >= max_retries
            "#,
        )
        .bind(stale_secs)
        .bind(CLAIM_EXPIRED)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?
        .rows_affected();
        if swept > 0 {
            warn!(count = swept, "dead-lettered stale claims with no retry budget");
        }

        let sql = format!(
            r#"
            UPDATE queue_items AS q
            SET status = 'processing',
                claimed_by = $1,
                claimed_at = NOW(),
                updated_at = NOW(),
                retry_count = CASE WHEN q.status = 'processing'
                                   THEN q.retry_count + 1 ELSE q.retry_count END,
                last_error = CASE WHEN q.status = 'processing'
                                  THEN $3 ELSE q.last_error END
            WHERE q.id = (
                SELECT id FROM queue_items
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'processing'
                       AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $2))
                       AND retry_count < max_retries)
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(stale_secs)
            .bind(CLAIM_EXPIRED)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        row.as_ref().map(row_to_item).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn complete(&self, id: ItemId, worker: &WorkerId) -> Result<(), QueueStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?
        .rows_affected();

        if done == 1 {
            Ok(())
        } else if self.exists(id, "complete").await? {
            Err(QueueStoreError::ClaimLost(id))
        } else {
            Err(QueueStoreError::NotFound(id))
        }
    }

    #[instrument(skip(self, error), fields(worker = %worker), err)]
    async fn fail(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        backoff: Duration,
        kind: FailureKind,
    ) -> Result<FailOutcome, QueueStoreError> {
        // $5: dead-letter regardless of budget.
        let row = sqlx::query(
            r#"
            WITH target AS (
                SELECT id, ($5 OR retry_count >= max_retries) AS terminal
                FROM queue_items
                WHERE id = $1 AND status = 'processing' AND claimed_by = $2
                FOR UPDATE
            )
            UPDATE queue_items AS q
            SET last_error = $3,
                updated_at = NOW(),
                status = CASE WHEN t.terminal THEN 'failed' ELSE 'pending' END,
                retry_count = CASE WHEN t.terminal THEN q.retry_count ELSE q.retry_count + 1 END,
                available_at = CASE WHEN t.terminal THEN q.available_at
                                    ELSE NOW() + make_interval(secs => $4) END,
                claimed_by = CASE WHEN t.terminal THEN q.claimed_by ELSE NULL END,
                claimed_at = CASE WHEN t.terminal THEN q.claimed_at ELSE NULL END
            FROM target AS t
            WHERE q.id = t.id
            RETURNING q.status, q.retry_count, q.available_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(error)
        .bind(seconds(backoff))
        .bind(kind == FailureKind::Permanent)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        let Some(row) = row else {
            return if self.exists(id, "fail").await? {
                Err(QueueStoreError::ClaimLost(id))
            } else {
                Err(QueueStoreError::NotFound(id))
            };
        };

        let status: String = row.try_get("status").map_err(|e| map_sqlx_error("fail", e))?;
        let retry_count: i32 = row
            .try_get("retry_count")
            .map_err(|e| map_sqlx_error("fail", e))?;
        let retry_count = u32::try_from(retry_count).unwrap_or(0);

        if status == ItemStatus::Failed.as_str() {
            Ok(FailOutcome::DeadLettered { retry_count })
        } else {
            let available_at: DateTime<Utc> = row
                .try_get("available_at")
                .map_err(|e| map_sqlx_error("fail", e))?;
            Ok(FailOutcome::Retrying {
                retry_count,
                available_at,
            })
        }
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM queue_items
            WHERE status = $1
            ORDER BY available_at ASC, created_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;
        rows.iter().map(row_to_item).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue(&self, id: ItemId) -> Result<QueueItem, QueueStoreError> {
        let sql = format!(
            r#"
            UPDATE queue_items
            SET status = 'pending',
                retry_count = 0,
                available_at = NOW(),
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        match row {
            Some(row) => row_to_item(&row),
            None => match self.get(id).await? {
                Some(item) => Err(QueueStoreError::InvalidTransition(format!(
                    "only failed items can be requeued (item {id} is {})",
                    item.status
                ))),
                None => Err(QueueStoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64, QueueStoreError> {
        let deleted = sqlx::query(
            "DELETE FROM queue_items WHERE status = 'completed' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_completed", e))?
        .rows_affected();
        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_items GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse::<ItemStatus>()
                .map_err(|e| QueueStoreError::Storage(e.to_string()))?;
            stats.record(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueStoreError {
    match err {
        sqlx::Error::Database(db_err) => QueueStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            QueueStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            QueueStoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => QueueStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
