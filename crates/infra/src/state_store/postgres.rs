//! Postgres-backed runtime state.
//!
//! Table `runtime_state (key TEXT PRIMARY KEY, value TEXT, updated_at TIMESTAMPTZ)`,
//! created by [`crate::schema::ensure_schema`]. Upserts use
//! `ON CONFLICT (key) DO UPDATE`, so concurrent writers from any number of
//! processes converge on one row per key (last write wins).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::r#trait::{RuntimeState, StateStore, StateStoreError};

#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: Arc<PgPool>,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), err)]
    async fn fetch_value(&self, key: &str) -> Result<Option<String>, StateStoreError> {
        let row = sqlx::query("SELECT value FROM runtime_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| row.try_get::<String, _>("value"))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, key: &str) -> Result<String, StateStoreError> {
        // A missing key is the steady state for kill switches and first runs,
        // so NotFound is produced outside the instrumented query.
        self.fetch_value(key)
            .await?
            .ok_or_else(|| StateStoreError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: &str) -> Result<(), StateStoreError> {
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key)
            DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<RuntimeState>, StateStoreError> {
        // left() instead of LIKE: the prefix may contain '%' or '_'.
        let rows = sqlx::query(
            r#"
            SELECT key, value, updated_at
            FROM runtime_state
            WHERE left(key, char_length($1)) = $1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_prefix", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let updated_at: DateTime<Utc> = row
                .try_get("updated_at")
                .map_err(|e| map_sqlx_error("list_by_prefix", e))?;
            out.push(RuntimeState {
                key: row
                    .try_get("key")
                    .map_err(|e| map_sqlx_error("list_by_prefix", e))?,
                value: row
                    .try_get("value")
                    .map_err(|e| map_sqlx_error("list_by_prefix", e))?,
                updated_at,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, key: &str) -> Result<(), StateStoreError> {
        sqlx::query("DELETE FROM runtime_state WHERE key = $1")
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StateStoreError {
    match err {
        sqlx::Error::Database(db_err) => StateStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StateStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StateStoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => StateStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
