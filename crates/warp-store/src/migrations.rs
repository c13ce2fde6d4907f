//! Schema migrations
//!
//! Forward-only, idempotent, recorded in `schema_migrations`. Each entry
//! runs at most once, inside its own transaction.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "init",
    r#"
CREATE TABLE IF NOT EXISTS accounts (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    label                 TEXT,
    email                 TEXT,
    refresh_token_ct      BLOB NOT NULL,
    fingerprint           TEXT NOT NULL UNIQUE,
    access_token          TEXT,
    access_expires_at     TEXT,
    quota_limit           INTEGER,
    quota_used            INTEGER,
    quota_next_refresh_at TEXT,
    quota_refresh_seconds INTEGER,
    quota_unlimited       INTEGER NOT NULL DEFAULT 0,
    use_count             INTEGER NOT NULL DEFAULT 0,
    error_count           INTEGER NOT NULL DEFAULT 0,
    last_error_code       TEXT,
    last_error_message    TEXT,
    last_success_at       TEXT,
    last_check_at         TEXT,
    cooldown_until        TEXT,
    status                TEXT NOT NULL DEFAULT 'active',
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER,
    actor      TEXT NOT NULL,
    action     TEXT NOT NULL,
    outcome    TEXT NOT NULL,
    detail     TEXT,
    at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_events_account
    ON audit_events (account_id, id);

CREATE TABLE IF NOT EXISTS health_snapshots (
    account_id           INTEGER PRIMARY KEY,
    healthy              INTEGER,
    last_checked_at      TEXT NOT NULL,
    last_success_at      TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    latency_ms           INTEGER,
    last_error           TEXT
);

CREATE TABLE IF NOT EXISTS app_state (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    expires_at TEXT
);
"#,
)];

/// Apply every pending migration.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (version, name, sql) in MIGRATIONS {
        let applied: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(version)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(name)
            .bind(chrono::Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version, name, "applied schema migration");
    }

    Ok(())
}
