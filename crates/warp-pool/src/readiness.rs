//! Readiness reporter
//!
//! Pure projection over the store answering "can I serve traffic now".
//! `ready` is exactly `available > 0`; `next_recovery_at` tells a client
//! with a 503 in hand when backing off is worth it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use warp_store::{AccountStatus, AccountStore};

use crate::select::is_eligible;

/// Pool-wide availability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub total: usize,
    pub available: usize,
    pub cooldown: usize,
    pub blocked: usize,
    pub quota_exhausted: usize,
    pub disabled: usize,
    pub ready: bool,
    /// Earliest instant a cooling account returns, when any is cooling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_recovery_at: Option<DateTime<Utc>>,
}

/// Compute the readiness snapshot.
pub async fn readiness(
    store: &AccountStore,
    h_fail_threshold: i64,
) -> Result<Readiness, warp_store::Error> {
    let now = Utc::now();
    let rows = store.list_with_health().await?;

    let mut report = Readiness {
        total: rows.len(),
        available: 0,
        cooldown: 0,
        blocked: 0,
        quota_exhausted: 0,
        disabled: 0,
        ready: false,
        next_recovery_at: None,
    };

    for (account, health) in &rows {
        match account.status {
            AccountStatus::Cooldown => report.cooldown += 1,
            AccountStatus::Blocked => report.blocked += 1,
            AccountStatus::QuotaExhausted => report.quota_exhausted += 1,
            AccountStatus::Disabled => report.disabled += 1,
            AccountStatus::Active => {}
        }

        let consecutive_failures = health
            .as_ref()
            .map(|h| h.consecutive_failures)
            .unwrap_or(0);
        if is_eligible(account, consecutive_failures, h_fail_threshold, now) {
            report.available += 1;
        }

        if matches!(
            account.status,
            AccountStatus::Cooldown | AccountStatus::QuotaExhausted
        ) && let Some(until) = account.cooldown_until
            && until > now
            && report.next_recovery_at.is_none_or(|current| until < current)
        {
            report.next_recovery_at = Some(until);
        }
    }

    report.ready = report.available > 0;
    Ok(report)
}
