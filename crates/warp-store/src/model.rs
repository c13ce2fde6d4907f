//! Persistent data model
//!
//! Row types for the accounts, audit_events, and health_snapshots tables,
//! plus the patch type every state transition is expressed as.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account lifecycle status.
///
/// Transitions:
/// - `Active` → `Cooldown` (rate limit, repeated failures)
/// - `Active` → `QuotaExhausted` (quota signal, remaining ≤ 0)
/// - `Active` → `Blocked` (refresh token rejected by the identity provider)
/// - `Cooldown` → `Active` (cooldown window elapsed, at selection time)
/// - `QuotaExhausted` → `Active` (health pass observed fresh quota)
/// - any → `Disabled` and `Disabled` → any: admin action only, except the
///   decrypt-failure path which force-disables a record it cannot open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Cooldown,
    Blocked,
    QuotaExhausted,
    Disabled,
}

impl AccountStatus {
    /// Stable column value / JSON label.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Blocked => "blocked",
            AccountStatus::QuotaExhausted => "quota_exhausted",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "cooldown" => Some(AccountStatus::Cooldown),
            "blocked" => Some(AccountStatus::Blocked),
            "quota_exhausted" => Some(AccountStatus::QuotaExhausted),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }
}

/// Last-known upstream quota for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub limit: i64,
    pub used: i64,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub refresh_seconds: Option<i64>,
    pub is_unlimited: bool,
}

impl QuotaSnapshot {
    /// Remaining requests. Unlimited accounts never run out, regardless of
    /// what the numeric fields claim.
    pub fn remaining(&self) -> Option<i64> {
        if self.is_unlimited {
            None
        } else {
            Some(self.limit - self.used)
        }
    }

    /// Whether this snapshot shows the quota spent.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining(), Some(r) if r <= 0)
    }
}

/// One upstream credential; the unit of rotation.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub label: Option<String>,
    pub email: Option<String>,
    /// Sealed refresh token: `nonce ‖ ciphertext ‖ tag`.
    pub refresh_token_ct: Vec<u8>,
    /// One-way fingerprint of the refresh token; unique per account.
    pub fingerprint: String,
    pub access_token: Option<String>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub quota: Option<QuotaSnapshot>,
    pub use_count: i64,
    pub error_count: i64,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Whether the cooldown window (if any) has elapsed at `now`.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Whether a usable access token is present at `now` (with `skew`
    /// subtracted so tokens on the edge of expiry are refreshed early).
    pub fn has_fresh_access_token(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match (&self.access_token, self.access_expires_at) {
            (Some(token), Some(expires)) if !token.is_empty() => now + skew < expires,
            _ => false,
        }
    }
}

/// Atomic change to one account row.
///
/// `Option<Option<T>>` fields distinguish "leave alone" (outer `None`)
/// from "clear" (`Some(None)`) from "set" (`Some(Some(v))`). Counter
/// bumps are flags so concurrent transitions cannot lose increments: the
/// new value is computed from the row read inside the transaction.
#[derive(Debug, Default, Clone)]
pub struct AccountPatch {
    pub status: Option<AccountStatus>,
    pub label: Option<Option<String>>,
    pub email: Option<Option<String>>,
    pub access_token: Option<Option<String>>,
    pub access_expires_at: Option<Option<DateTime<Utc>>>,
    pub refresh_token_ct: Option<Vec<u8>>,
    pub quota: Option<Option<QuotaSnapshot>>,
    pub bump_use_count: bool,
    pub bump_error_count: bool,
    pub reset_error_count: bool,
    /// Also zero `consecutive_failures` in the account's health snapshot,
    /// inside the same transaction.
    pub reset_consecutive_failures: bool,
    pub last_error: Option<Option<(String, String)>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<Option<DateTime<Utc>>>,
}

/// Who caused an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    Admin,
    Runtime,
    Monitor,
}

impl AuditActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActor::Admin => "admin",
            AuditActor::Runtime => "runtime",
            AuditActor::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(AuditActor::Admin),
            "runtime" => Some(AuditActor::Runtime),
            "monitor" => Some(AuditActor::Monitor),
            _ => None,
        }
    }
}

/// A new audit event, before insertion assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub account_id: Option<i64>,
    pub actor: AuditActor,
    pub action: String,
    pub outcome: String,
    pub detail: Option<serde_json::Value>,
}

impl NewAuditEvent {
    pub fn new(actor: AuditActor, action: &str, outcome: &str) -> Self {
        Self {
            account_id: None,
            actor,
            action: action.to_string(),
            outcome: outcome.to_string(),
            detail: None,
        }
    }

    pub fn account(mut self, id: i64) -> Self {
        self.account_id = Some(id);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// A stored audit event. Append-only; never updated or deleted.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub account_id: Option<i64>,
    pub actor: AuditActor,
    pub action: String,
    pub outcome: String,
    pub detail: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Filter for paging through the audit log.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub account_id: Option<i64>,
    pub actor: Option<AuditActor>,
    /// Return events with id strictly below this (newest-first paging).
    pub before_id: Option<i64>,
}

/// Per-account probe result, owned by the health monitor.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub account_id: i64,
    pub healthy: Option<bool>,
    pub last_checked_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub latency_ms: Option<i64>,
    pub last_error: Option<String>,
}

/// One row of a batch import.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportEntry {
    pub refresh_token: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Outcome of inserting a single account.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Account),
    /// An account with the same fingerprint already exists.
    Duplicate { existing_id: i64 },
}

/// Batch import summary with per-row outcomes.
#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub rows: Vec<ImportRowOutcome>,
}

/// Per-row import outcome, keyed by position in the request.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImportRowOutcome {
    Inserted { id: i64 },
    Duplicate { existing_id: i64 },
    Error { detail: String },
}

/// Pool-wide counts for the statistics endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Statistics {
    pub total: i64,
    pub active: i64,
    pub cooldown: i64,
    pub blocked: i64,
    pub quota_exhausted: i64,
    pub disabled: i64,
    pub healthy: i64,
    pub unhealthy: i64,
    pub health_unknown: i64,
    pub total_use_count: i64,
    pub total_error_count: i64,
}
