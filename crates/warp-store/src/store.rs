//! SQLite-backed account repository
//!
//! Single-writer discipline: one connection performs all writes, while a
//! small reader pool serves queries under WAL. Every state transition
//! runs through [`AccountStore::update_with_audit`], which updates the
//! row and appends the audit event in one transaction.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use common::Secret;

use crate::crypto::{CryptoBox, fingerprint};
use crate::error::{Error, Result};
use crate::migrations;
use crate::model::{
    Account, AccountPatch, AccountStatus, AuditActor, AuditEvent, AuditFilter, HealthSnapshot,
    ImportEntry, ImportReport, ImportRowOutcome, InsertOutcome, NewAuditEvent, QuotaSnapshot,
    Statistics,
};

const ACCOUNT_COLUMNS: &str = "id, label, email, refresh_token_ct, fingerprint, access_token, \
     access_expires_at, quota_limit, quota_used, quota_next_refresh_at, quota_refresh_seconds, \
     quota_unlimited, use_count, error_count, last_error_code, last_error_message, \
     last_success_at, last_check_at, cooldown_until, status, created_at, updated_at";

/// Process-wide owner of the SQLite database and the token crypto box.
pub struct AccountStore {
    writer: SqlitePool,
    reader: SqlitePool,
    crypto: CryptoBox,
}

impl AccountStore {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>, crypto: CryptoBox) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        migrations::run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!(path = %path.as_ref().display(), "account store opened");
        Ok(Self {
            writer,
            reader,
            crypto,
        })
    }

    /// Close both pools. Call after background tasks have stopped.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }

    // ── accounts ───────────────────────────────────────────────────────

    /// All accounts, ordered by id.
    pub async fn list(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"
        ))
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.reader)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn find_by_fingerprint(&self, fp: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE fingerprint = ?"
        ))
        .bind(fp)
        .fetch_optional(&self.reader)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    /// Insert one account from a plaintext refresh token.
    ///
    /// Deduplicates by fingerprint; the token is sealed before it reaches
    /// the database. Audited as an admin import.
    pub async fn insert(
        &self,
        refresh_token: &str,
        label: Option<&str>,
        email: Option<&str>,
    ) -> Result<InsertOutcome> {
        let fp = fingerprint(refresh_token);
        if let Some(existing) = self.find_by_fingerprint(&fp).await? {
            return Ok(InsertOutcome::Duplicate {
                existing_id: existing.id,
            });
        }

        let sealed = self.crypto.encrypt(refresh_token.as_bytes())?;
        let now = Utc::now();
        let mut tx = self.writer.begin().await?;

        let result = sqlx::query(
            "INSERT INTO accounts \
             (label, email, refresh_token_ct, fingerprint, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(label)
        .bind(email)
        .bind(&sealed)
        .bind(&fp)
        .bind(AccountStatus::Active.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                drop(tx);
                let existing = self
                    .find_by_fingerprint(&fp)
                    .await?
                    .ok_or(Error::Duplicate)?;
                return Ok(InsertOutcome::Duplicate {
                    existing_id: existing.id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        insert_audit(
            &mut tx,
            &NewAuditEvent::new(AuditActor::Admin, "import", "inserted").account(id),
        )
        .await?;
        tx.commit().await?;

        debug!(account_id = id, "account imported");
        self.get(id).await?.ok_or(Error::NotFound(id)).map(InsertOutcome::Inserted)
    }

    /// Import many refresh tokens, deduplicating by fingerprint.
    ///
    /// Rows also deduplicate against each other within one call; the
    /// report carries a per-row outcome in request order.
    pub async fn batch_import(&self, entries: &[ImportEntry]) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for entry in entries {
            let token = entry.refresh_token.trim();
            if token.is_empty() {
                report.errors += 1;
                report.rows.push(ImportRowOutcome::Error {
                    detail: "empty refresh token".into(),
                });
                continue;
            }
            match self
                .insert(token, entry.label.as_deref(), entry.email.as_deref())
                .await
            {
                Ok(InsertOutcome::Inserted(account)) => {
                    report.inserted += 1;
                    report.rows.push(ImportRowOutcome::Inserted { id: account.id });
                }
                Ok(InsertOutcome::Duplicate { existing_id }) => {
                    report.duplicates += 1;
                    report.rows.push(ImportRowOutcome::Duplicate { existing_id });
                }
                Err(e) => {
                    warn!(error = %e, "import row failed");
                    report.errors += 1;
                    report.rows.push(ImportRowOutcome::Error {
                        detail: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Apply a patch and append the matching audit event atomically.
    ///
    /// Counter bumps are computed from the row as read inside the
    /// transaction; the single writer serializes concurrent transitions.
    pub async fn update_with_audit(
        &self,
        id: i64,
        patch: AccountPatch,
        audit: NewAuditEvent,
    ) -> Result<Account> {
        let mut tx = self.writer.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(Error::NotFound(id));
        };
        let mut account = account_from_row(&row)?;
        apply_patch(&mut account, &patch);
        account.updated_at = Utc::now();

        let quota = account.quota.as_ref();
        sqlx::query(
            "UPDATE accounts SET \
             label = ?, email = ?, refresh_token_ct = ?, access_token = ?, \
             access_expires_at = ?, quota_limit = ?, quota_used = ?, \
             quota_next_refresh_at = ?, quota_refresh_seconds = ?, quota_unlimited = ?, \
             use_count = ?, error_count = ?, last_error_code = ?, last_error_message = ?, \
             last_success_at = ?, last_check_at = ?, cooldown_until = ?, status = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&account.label)
        .bind(&account.email)
        .bind(&account.refresh_token_ct)
        .bind(&account.access_token)
        .bind(account.access_expires_at)
        .bind(quota.map(|q| q.limit))
        .bind(quota.map(|q| q.used))
        .bind(quota.and_then(|q| q.next_refresh_at))
        .bind(quota.and_then(|q| q.refresh_seconds))
        .bind(quota.map(|q| q.is_unlimited).unwrap_or(false))
        .bind(account.use_count)
        .bind(account.error_count)
        .bind(&account.last_error_code)
        .bind(&account.last_error_message)
        .bind(account.last_success_at)
        .bind(account.last_check_at)
        .bind(account.cooldown_until)
        .bind(account.status.as_str())
        .bind(account.updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if patch.reset_consecutive_failures {
            sqlx::query(
                "UPDATE health_snapshots SET consecutive_failures = 0, healthy = 1 \
                 WHERE account_id = ?",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        insert_audit(&mut tx, &audit.account(id)).await?;
        tx.commit().await?;
        Ok(account)
    }

    /// Delete an account, its health snapshot, and audit the removal.
    ///
    /// Returns whether a row existed. Audit events referencing the
    /// account are kept; the log is append-only.
    pub async fn delete(&self, id: i64, audit: NewAuditEvent) -> Result<bool> {
        let mut tx = self.writer.begin().await?;
        let done = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let existed = done.rows_affected() > 0;
        sqlx::query("DELETE FROM health_snapshots WHERE account_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_audit(&mut tx, &audit.account(id)).await?;
        tx.commit().await?;
        Ok(existed)
    }

    pub async fn batch_delete(&self, ids: &[i64]) -> Result<u64> {
        let mut removed = 0;
        for &id in ids {
            if self
                .delete(
                    id,
                    NewAuditEvent::new(AuditActor::Admin, "delete", "removed"),
                )
                .await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Decrypt an account's sealed refresh token.
    pub fn decrypt_refresh_token(&self, account: &Account) -> Result<Secret<String>> {
        self.crypto.decrypt(&account.refresh_token_ct)
    }

    /// Seal a plaintext refresh token (for rotation persistence).
    pub fn seal_refresh_token(&self, token: &str) -> Result<Vec<u8>> {
        self.crypto.encrypt(token.as_bytes())
    }

    // ── health snapshots ───────────────────────────────────────────────

    pub async fn snapshot_health(&self, snapshot: &HealthSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO health_snapshots \
             (account_id, healthy, last_checked_at, last_success_at, consecutive_failures, \
              latency_ms, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET \
             healthy = excluded.healthy, last_checked_at = excluded.last_checked_at, \
             last_success_at = excluded.last_success_at, \
             consecutive_failures = excluded.consecutive_failures, \
             latency_ms = excluded.latency_ms, last_error = excluded.last_error",
        )
        .bind(snapshot.account_id)
        .bind(snapshot.healthy)
        .bind(snapshot.last_checked_at)
        .bind(snapshot.last_success_at)
        .bind(snapshot.consecutive_failures)
        .bind(snapshot.latency_ms)
        .bind(&snapshot.last_error)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn read_health(&self, id: i64) -> Result<Option<HealthSnapshot>> {
        let row = sqlx::query("SELECT * FROM health_snapshots WHERE account_id = ?")
            .bind(id)
            .fetch_optional(&self.reader)
            .await?;
        row.as_ref().map(health_from_row).transpose()
    }

    pub async fn list_health(&self) -> Result<Vec<HealthSnapshot>> {
        let rows = sqlx::query("SELECT * FROM health_snapshots ORDER BY account_id")
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(health_from_row).collect()
    }

    /// Accounts joined with their health snapshots (selector input).
    pub async fn list_with_health(&self) -> Result<Vec<(Account, Option<HealthSnapshot>)>> {
        let accounts = self.list().await?;
        let mut health: std::collections::HashMap<i64, HealthSnapshot> = self
            .list_health()
            .await?
            .into_iter()
            .map(|s| (s.account_id, s))
            .collect();
        Ok(accounts
            .into_iter()
            .map(|a| {
                let snapshot = health.remove(&a.id);
                (a, snapshot)
            })
            .collect())
    }

    // ── audit log ──────────────────────────────────────────────────────

    /// Append one audit event outside any transition.
    ///
    /// Callers on non-critical paths treat failures as log-and-continue;
    /// the error is still surfaced for the ones that care.
    pub async fn append_audit(&self, event: NewAuditEvent) -> Result<()> {
        let mut tx = self.writer.begin().await?;
        insert_audit(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Newest-first page of the audit log.
    pub async fn list_audit(&self, filter: &AuditFilter, limit: u32) -> Result<Vec<AuditEvent>> {
        let mut sql = String::from(
            "SELECT id, account_id, actor, action, outcome, detail, at FROM audit_events WHERE 1=1",
        );
        if filter.account_id.is_some() {
            sql.push_str(" AND account_id = ?");
        }
        if filter.actor.is_some() {
            sql.push_str(" AND actor = ?");
        }
        if filter.before_id.is_some() {
            sql.push_str(" AND id < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(account_id) = filter.account_id {
            query = query.bind(account_id);
        }
        if let Some(actor) = filter.actor {
            query = query.bind(actor.as_str());
        }
        if let Some(before_id) = filter.before_id {
            query = query.bind(before_id);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.reader).await?;
        rows.iter().map(audit_from_row).collect()
    }

    // ── statistics ─────────────────────────────────────────────────────

    pub async fn list_statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n, SUM(use_count) AS uses, SUM(error_count) AS errors \
             FROM accounts GROUP BY status",
        )
        .fetch_all(&self.reader)
        .await?;
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.total += n;
            stats.total_use_count += row.try_get::<Option<i64>, _>("uses")?.unwrap_or(0);
            stats.total_error_count += row.try_get::<Option<i64>, _>("errors")?.unwrap_or(0);
            match AccountStatus::parse(&status) {
                Some(AccountStatus::Active) => stats.active = n,
                Some(AccountStatus::Cooldown) => stats.cooldown = n,
                Some(AccountStatus::Blocked) => stats.blocked = n,
                Some(AccountStatus::QuotaExhausted) => stats.quota_exhausted = n,
                Some(AccountStatus::Disabled) => stats.disabled = n,
                None => return Err(Error::Corrupt(format!("unknown status {status}"))),
            }
        }

        let rows = sqlx::query(
            "SELECT healthy, COUNT(*) AS n FROM health_snapshots GROUP BY healthy",
        )
        .fetch_all(&self.reader)
        .await?;
        for row in &rows {
            let healthy: Option<bool> = row.try_get("healthy")?;
            let n: i64 = row.try_get("n")?;
            match healthy {
                Some(true) => stats.healthy = n,
                Some(false) => stats.unhealthy = n,
                None => stats.health_unknown += n,
            }
        }
        // Accounts never probed have no snapshot row at all.
        stats.health_unknown += stats.total - stats.healthy - stats.unhealthy - stats.health_unknown;

        Ok(stats)
    }

    // ── app state KV ───────────────────────────────────────────────────

    pub async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        sqlx::query(
            "INSERT INTO app_state (key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value, expires_at FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.reader)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
        if let Some(expires_at) = expires_at
            && expires_at <= Utc::now()
        {
            self.kv_del(key).await?;
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    pub async fn kv_del(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_state WHERE key = ?")
            .bind(key)
            .execute(&self.writer)
            .await?;
        Ok(())
    }
}

/// Apply a patch to an in-memory account (inside the update transaction).
fn apply_patch(account: &mut Account, patch: &AccountPatch) {
    if let Some(status) = patch.status {
        account.status = status;
    }
    if let Some(label) = &patch.label {
        account.label = label.clone();
    }
    if let Some(email) = &patch.email {
        account.email = email.clone();
    }
    if let Some(token) = &patch.access_token {
        account.access_token = token.clone();
    }
    if let Some(expires) = patch.access_expires_at {
        account.access_expires_at = expires;
    }
    if let Some(ct) = &patch.refresh_token_ct {
        account.refresh_token_ct = ct.clone();
    }
    if let Some(quota) = &patch.quota {
        account.quota = quota.clone();
    }
    if patch.bump_use_count {
        account.use_count += 1;
    }
    if patch.bump_error_count {
        account.error_count += 1;
    }
    if patch.reset_error_count {
        account.error_count = 0;
    }
    if let Some(last_error) = &patch.last_error {
        match last_error {
            Some((code, message)) => {
                account.last_error_code = Some(code.clone());
                account.last_error_message = Some(message.clone());
            }
            None => {
                account.last_error_code = None;
                account.last_error_message = None;
            }
        }
    }
    if let Some(at) = patch.last_success_at {
        account.last_success_at = Some(at);
    }
    if let Some(at) = patch.last_check_at {
        account.last_check_at = Some(at);
    }
    if let Some(until) = patch.cooldown_until {
        account.cooldown_until = until;
    }
}

async fn insert_audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &NewAuditEvent,
) -> Result<()> {
    let detail = event
        .detail
        .as_ref()
        .map(|d| serde_json::to_string(d).unwrap_or_default());
    sqlx::query(
        "INSERT INTO audit_events (account_id, actor, action, outcome, detail, at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event.account_id)
    .bind(event.actor.as_str())
    .bind(&event.action)
    .bind(&event.outcome)
    .bind(detail)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let status_str: String = row.try_get("status")?;
    let status = AccountStatus::parse(&status_str)
        .ok_or_else(|| Error::Corrupt(format!("unknown status {status_str}")))?;

    let quota_limit: Option<i64> = row.try_get("quota_limit")?;
    let quota_unlimited: bool = row.try_get("quota_unlimited")?;
    let quota = if quota_limit.is_some() || quota_unlimited {
        Some(QuotaSnapshot {
            limit: quota_limit.unwrap_or(0),
            used: row.try_get::<Option<i64>, _>("quota_used")?.unwrap_or(0),
            next_refresh_at: row.try_get("quota_next_refresh_at")?,
            refresh_seconds: row.try_get("quota_refresh_seconds")?,
            is_unlimited: quota_unlimited,
        })
    } else {
        None
    };

    Ok(Account {
        id: row.try_get("id")?,
        label: row.try_get("label")?,
        email: row.try_get("email")?,
        refresh_token_ct: row.try_get("refresh_token_ct")?,
        fingerprint: row.try_get("fingerprint")?,
        access_token: row.try_get("access_token")?,
        access_expires_at: row.try_get("access_expires_at")?,
        quota,
        use_count: row.try_get("use_count")?,
        error_count: row.try_get("error_count")?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
        last_success_at: row.try_get("last_success_at")?,
        last_check_at: row.try_get("last_check_at")?,
        cooldown_until: row.try_get("cooldown_until")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn health_from_row(row: &SqliteRow) -> Result<HealthSnapshot> {
    Ok(HealthSnapshot {
        account_id: row.try_get("account_id")?,
        healthy: row.try_get("healthy")?,
        last_checked_at: row.try_get("last_checked_at")?,
        last_success_at: row.try_get("last_success_at")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        latency_ms: row.try_get("latency_ms")?,
        last_error: row.try_get("last_error")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEvent> {
    let actor_str: String = row.try_get("actor")?;
    let actor = AuditActor::parse(&actor_str)
        .ok_or_else(|| Error::Corrupt(format!("unknown actor {actor_str}")))?;
    let detail: Option<String> = row.try_get("detail")?;
    Ok(AuditEvent {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        actor,
        action: row.try_get("action")?,
        outcome: row.try_get("outcome")?,
        detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
        at: row.try_get("at")?,
    })
}
