//! Account selection
//!
//! Filters the pool snapshot down to eligible accounts, orders them
//! deterministically, and returns the first whose exclusivity lock can be
//! taken without blocking. When every eligible account is busy, waits a
//! bounded time for any one lock to free.
//!
//! A `cooldown` account whose window has elapsed is promoted back to
//! `active` here, at the moment it would otherwise be skipped; no
//! separate sweeper runs.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::select_all;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use warp_store::{
    Account, AccountPatch, AccountStatus, AccountStore, AuditActor, NewAuditEvent,
};

use crate::locks::AccountLocks;

/// Selector tuning.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Accounts at or past this many consecutive probe failures are
    /// skipped until the health monitor sees them recover.
    pub h_fail_threshold: i64,
    /// How long to wait for a busy lock when every eligible account is
    /// already in flight.
    pub lock_wait: Duration,
}

/// One eligible account with the health data the ordering needs.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub account: Account,
    pub consecutive_failures: i64,
}

/// Eligibility predicate.
///
/// `active` with no live cooldown, under the failure threshold, with a
/// refresh token on file. An elapsed-cooldown `cooldown` account counts
/// as eligible (it is promoted on selection).
pub fn is_eligible(
    account: &Account,
    consecutive_failures: i64,
    h_fail_threshold: i64,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    if !matches!(
        account.status,
        AccountStatus::Active | AccountStatus::Cooldown
    ) {
        return false;
    }
    if !account.cooldown_elapsed(now) {
        return false;
    }
    if consecutive_failures >= h_fail_threshold {
        return false;
    }
    if account.refresh_token_ct.is_empty() {
        return false;
    }
    true
}

/// Deterministic ordering among eligible accounts: fewest errors first,
/// then least-recently-successful (never-successful counts as oldest),
/// then least-used, then id.
pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.account
            .error_count
            .cmp(&b.account.error_count)
            .then_with(|| a.account.last_success_at.cmp(&b.account.last_success_at))
            .then_with(|| a.account.use_count.cmp(&b.account.use_count))
            .then_with(|| a.account.id.cmp(&b.account.id))
    });
}

/// Select an eligible account and acquire its lock.
///
/// Returns `None` when no eligible account exists, or when the only
/// eligible accounts stayed locked past the bounded wait.
pub async fn select_account(
    store: &AccountStore,
    locks: &AccountLocks,
    exclude_ids: &HashSet<i64>,
    config: &SelectorConfig,
) -> Result<Option<(Account, OwnedMutexGuard<()>)>, warp_store::Error> {
    let now = Utc::now();
    let mut candidates: Vec<Candidate> = store
        .list_with_health()
        .await?
        .into_iter()
        .filter(|(account, _)| !exclude_ids.contains(&account.id))
        .filter_map(|(account, health)| {
            let consecutive_failures = health.map(|h| h.consecutive_failures).unwrap_or(0);
            is_eligible(&account, consecutive_failures, config.h_fail_threshold, now).then_some(
                Candidate {
                    account,
                    consecutive_failures,
                },
            )
        })
        .collect();

    if candidates.is_empty() {
        return Ok(None);
    }
    order_candidates(&mut candidates);

    for candidate in &candidates {
        if let Some(guard) = locks.try_acquire(candidate.account.id) {
            let account = promote_if_thawed(store, &candidate.account).await?;
            debug!(account_id = account.id, "account selected");
            return Ok(Some((account, guard)));
        }
    }

    // Every eligible account is mid-flight; wait for whichever frees first.
    type Waiter = Pin<Box<dyn Future<Output = (i64, OwnedMutexGuard<()>)> + Send>>;
    let waiters: Vec<Waiter> = candidates
        .iter()
        .map(|c| {
            let lock = locks.waiter(c.account.id);
            let id = c.account.id;
            Box::pin(async move { (id, lock.lock_owned().await) }) as Waiter
        })
        .collect();

    match tokio::time::timeout(config.lock_wait, select_all(waiters)).await {
        Ok(((id, guard), _, _)) => {
            // State may have moved while we waited; re-read and re-check.
            let Some(account) = store.get(id).await? else {
                return Ok(None);
            };
            let health = store.read_health(id).await?;
            let consecutive_failures = health.map(|h| h.consecutive_failures).unwrap_or(0);
            if !is_eligible(
                &account,
                consecutive_failures,
                config.h_fail_threshold,
                Utc::now(),
            ) {
                return Ok(None);
            }
            let account = promote_if_thawed(store, &account).await?;
            debug!(account_id = account.id, "account selected after lock wait");
            Ok(Some((account, guard)))
        }
        Err(_) => Ok(None),
    }
}

/// Promote an elapsed-cooldown account back to `active`.
async fn promote_if_thawed(
    store: &AccountStore,
    account: &Account,
) -> Result<Account, warp_store::Error> {
    if account.status != AccountStatus::Cooldown {
        return Ok(account.clone());
    }
    info!(account_id = account.id, "cooldown elapsed, account active again");
    store
        .update_with_audit(
            account.id,
            AccountPatch {
                status: Some(AccountStatus::Active),
                cooldown_until: Some(None),
                ..Default::default()
            },
            NewAuditEvent::new(AuditActor::Runtime, "cooldown", "elapsed"),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use warp_store::{CryptoBox, InsertOutcome};

    fn account(id: i64) -> Account {
        let now = Utc::now();
        Account {
            id,
            label: None,
            email: None,
            refresh_token_ct: vec![1, 2, 3],
            fingerprint: format!("fp{id}"),
            access_token: None,
            access_expires_at: None,
            quota: None,
            use_count: 0,
            error_count: 0,
            last_error_code: None,
            last_error_message: None,
            last_success_at: None,
            last_check_at: None,
            cooldown_until: None,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn blocked_and_disabled_never_eligible() {
        let now = Utc::now();
        for status in [
            AccountStatus::Blocked,
            AccountStatus::Disabled,
            AccountStatus::QuotaExhausted,
        ] {
            let mut a = account(1);
            a.status = status;
            assert!(!is_eligible(&a, 0, 3, now), "status {status:?}");
        }
    }

    #[test]
    fn live_cooldown_never_eligible() {
        let now = Utc::now();
        let mut a = account(1);
        a.status = AccountStatus::Cooldown;
        a.cooldown_until = Some(now + ChronoDuration::seconds(60));
        assert!(!is_eligible(&a, 0, 3, now));

        // Elapsed window makes it promotable.
        a.cooldown_until = Some(now - ChronoDuration::seconds(1));
        assert!(is_eligible(&a, 0, 3, now));
    }

    #[test]
    fn failure_threshold_excludes() {
        let now = Utc::now();
        let a = account(1);
        assert!(is_eligible(&a, 2, 3, now));
        assert!(!is_eligible(&a, 3, 3, now));
    }

    #[test]
    fn missing_refresh_token_excludes() {
        let now = Utc::now();
        let mut a = account(1);
        a.refresh_token_ct.clear();
        assert!(!is_eligible(&a, 0, 3, now));
    }

    #[test]
    fn ordering_prefers_fewest_errors_then_oldest_success() {
        let now = Utc::now();
        let mut c = vec![
            Candidate {
                account: {
                    let mut a = account(1);
                    a.error_count = 2;
                    a
                },
                consecutive_failures: 0,
            },
            Candidate {
                account: {
                    let mut a = account(2);
                    a.last_success_at = Some(now);
                    a
                },
                consecutive_failures: 0,
            },
            Candidate {
                account: {
                    let mut a = account(3);
                    a.last_success_at = Some(now - ChronoDuration::minutes(5));
                    a
                },
                consecutive_failures: 0,
            },
            Candidate {
                account: account(4), // never succeeded → first among zero-error
                consecutive_failures: 0,
            },
        ];
        order_candidates(&mut c);
        let ids: Vec<i64> = c.iter().map(|x| x.account.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    #[test]
    fn ordering_tie_breaks_on_use_count_then_id() {
        let mut c = vec![
            Candidate {
                account: {
                    let mut a = account(5);
                    a.use_count = 9;
                    a
                },
                consecutive_failures: 0,
            },
            Candidate {
                account: {
                    let mut a = account(2);
                    a.use_count = 1;
                    a
                },
                consecutive_failures: 0,
            },
            Candidate {
                account: {
                    let mut a = account(8);
                    a.use_count = 1;
                    a
                },
                consecutive_failures: 0,
            },
        ];
        order_candidates(&mut c);
        let ids: Vec<i64> = c.iter().map(|x| x.account.id).collect();
        assert_eq!(ids, vec![2, 8, 5]);
    }

    async fn seeded_store(dir: &tempfile::TempDir, tokens: &[&str]) -> AccountStore {
        let store = AccountStore::open(dir.path().join("t.db"), CryptoBox::from_key([3u8; 32]))
            .await
            .unwrap();
        for token in tokens {
            match store.insert(token, None, None).await.unwrap() {
                InsertOutcome::Inserted(_) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        store
    }

    fn test_config() -> SelectorConfig {
        SelectorConfig {
            h_fail_threshold: 3,
            lock_wait: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn empty_pool_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &[]).await;
        let locks = AccountLocks::new();
        let got = select_account(&store, &locks, &HashSet::new(), &test_config())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn excluded_accounts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &["rt_a", "rt_b"]).await;
        let locks = AccountLocks::new();

        let (first, _g1) = select_account(&store, &locks, &HashSet::new(), &test_config())
            .await
            .unwrap()
            .unwrap();
        let excluded: HashSet<i64> = [first.id].into();
        let (second, _g2) = select_account(&store, &locks, &excluded, &test_config())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);

        let all: HashSet<i64> = [first.id, second.id].into();
        assert!(
            select_account(&store, &locks, &all, &test_config())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn busy_lock_falls_through_to_next_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &["rt_a", "rt_b"]).await;
        let locks = AccountLocks::new();

        let ids: Vec<i64> = store.list().await.unwrap().iter().map(|a| a.id).collect();
        let _held = locks.try_acquire(ids[0]).unwrap();

        let (selected, _guard) = select_account(&store, &locks, &HashSet::new(), &test_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, ids[1]);
    }

    #[tokio::test]
    async fn all_busy_waits_then_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &["rt_only"]).await;
        let locks = AccountLocks::new();
        let id = store.list().await.unwrap()[0].id;
        let _held = locks.try_acquire(id).unwrap();

        let got = select_account(&store, &locks, &HashSet::new(), &test_config())
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn all_busy_grabs_lock_when_freed() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &["rt_only"]).await;
        let locks = Arc::new(AccountLocks::new());
        let id = store.list().await.unwrap()[0].id;
        let held = locks.try_acquire(id).unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        });

        let config = SelectorConfig {
            h_fail_threshold: 3,
            lock_wait: Duration::from_secs(1),
        };
        let got = select_account(&store, &locks, &HashSet::new(), &config)
            .await
            .unwrap();
        assert!(got.is_some());
        release.await.unwrap();
    }



    #[tokio::test]
    async fn elapsed_cooldown_is_promoted_on_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, &["rt_cool"]).await;
        let id = store.list().await.unwrap()[0].id;
        store
            .update_with_audit(
                id,
                AccountPatch {
                    status: Some(AccountStatus::Cooldown),
                    cooldown_until: Some(Some(Utc::now() - ChronoDuration::seconds(5))),
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "rate_limited"),
            )
            .await
            .unwrap();

        let locks = AccountLocks::new();
        let (selected, _guard) = select_account(&store, &locks, &HashSet::new(), &test_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.status, AccountStatus::Active);
        assert!(selected.cooldown_until.is_none());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Active);
    }
}
