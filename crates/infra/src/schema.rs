//! Idempotent schema bootstrap for the Postgres backends.

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "runtime_state",
        r#"
        CREATE TABLE IF NOT EXISTS runtime_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "queue_items",
        r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            id            UUID PRIMARY KEY,
            item_type     TEXT NOT NULL,
            payload       JSONB NOT NULL,
            status        TEXT NOT NULL
                          CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            retry_count   INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            max_retries   INTEGER NOT NULL CHECK (max_retries >= 0),
            claimed_by    TEXT NULL,
            claimed_at    TIMESTAMPTZ NULL,
            available_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_error    TEXT NULL,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (retry_count <= max_retries)
        )
        "#,
    ),
    (
        "queue_items_claimable_idx",
        r#"
        CREATE INDEX IF NOT EXISTS queue_items_claimable_idx
            ON queue_items (status, available_at, created_at)
        "#,
    ),
];

/// Create `runtime_state` and `queue_items` (with indexes) if missing.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    for (name, sql) in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create {name}"))?;
    }
    info!("database schema ready");
    Ok(())
}
