//! Refresh persistence
//!
//! One place turns a classified refresh outcome into account state:
//! dispatch (stale token, auth-expired retry), the health monitor, and
//! admin force-refresh all funnel through [`refresh_account`]. The caller
//! must hold the account's exclusivity lock.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use warp_auth::{Quota, RefreshError};
use warp_store::{
    Account, AccountPatch, AccountStatus, AccountStore, AuditActor, NewAuditEvent, QuotaSnapshot,
};

use crate::Refresher;

/// Classified, persisted result of one refresh.
#[derive(Debug)]
pub enum RefreshResult {
    /// Token persisted; the updated account row.
    Ok(Box<Account>),
    /// Refresh token rejected; account now `blocked`.
    Rejected,
    /// Provider reports the quota spent; account now `quota_exhausted`.
    QuotaExhausted,
    /// Retryable provider failure; error counter bumped.
    Transient,
    /// Provider unreachable; error counter bumped.
    Network,
    /// The sealed refresh token would not open; account now `disabled`.
    DecryptFailed,
}

impl RefreshResult {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshResult::Ok(_) => "ok",
            RefreshResult::Rejected => "refresh_rejected",
            RefreshResult::QuotaExhausted => "quota_exhausted",
            RefreshResult::Transient => "refresh_transient",
            RefreshResult::Network => "network",
            RefreshResult::DecryptFailed => "decrypt_failed",
        }
    }
}

fn quota_snapshot(quota: &Quota) -> QuotaSnapshot {
    QuotaSnapshot {
        limit: quota.limit,
        used: quota.used,
        next_refresh_at: quota.next_refresh_at,
        refresh_seconds: quota.refresh_seconds,
        is_unlimited: quota.is_unlimited,
    }
}

/// Refresh `account`'s access token and persist the classified outcome.
///
/// On success the new token (and a rotated refresh token, when the
/// provider sends one) is stored, `last_success_at` set, the error
/// counter reset. A fresh quota snapshot showing the window spent parks
/// the account in `quota_exhausted` for `cooldown_long`; one showing
/// headroom restores a `quota_exhausted` account to `active`.
pub async fn refresh_account(
    store: &AccountStore,
    refresher: &dyn Refresher,
    account: &Account,
    actor: AuditActor,
    cooldown_long: Duration,
) -> Result<RefreshResult, warp_store::Error> {
    let now = Utc::now();

    let refresh_token = match store.decrypt_refresh_token(account) {
        Ok(token) => token,
        Err(warp_store::Error::Decrypt) => {
            warn!(account_id = account.id, "refresh token failed to decrypt, disabling account");
            store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        status: Some(AccountStatus::Disabled),
                        last_error: Some(Some((
                            "decrypt_failed".into(),
                            "stored refresh token failed to decrypt".into(),
                        ))),
                        last_check_at: Some(now),
                        ..Default::default()
                    },
                    NewAuditEvent::new(actor, "refresh", "decrypt_failed"),
                )
                .await?;
            return Ok(RefreshResult::DecryptFailed);
        }
        Err(e) => return Err(e),
    };

    match refresher.refresh(refresh_token.expose_str()).await {
        Ok(grant) => {
            let rotated_ct = match &grant.refresh_token {
                Some(new_token) => Some(store.seal_refresh_token(new_token)?),
                None => None,
            };
            let quota = grant.quota.as_ref().map(quota_snapshot);
            let quota_spent = quota.as_ref().is_some_and(|q| q.is_exhausted());

            let mut patch = AccountPatch {
                access_token: Some(Some(grant.access_token.clone())),
                access_expires_at: Some(Some(grant.expires_at)),
                refresh_token_ct: rotated_ct,
                quota: quota.clone().map(Some),
                reset_error_count: true,
                last_error: Some(None),
                last_success_at: Some(now),
                last_check_at: Some(now),
                ..Default::default()
            };

            if quota_spent {
                let until = now
                    + chrono::Duration::from_std(cooldown_long).unwrap_or_default();
                patch.status = Some(AccountStatus::QuotaExhausted);
                patch.cooldown_until = Some(Some(until));
                let updated = store
                    .update_with_audit(
                        account.id,
                        patch,
                        NewAuditEvent::new(actor, "refresh", "quota_exhausted"),
                    )
                    .await?;
                info!(account_id = updated.id, "quota spent, long cooldown");
                return Ok(RefreshResult::QuotaExhausted);
            }

            if account.status == AccountStatus::QuotaExhausted
                && quota.as_ref().is_some_and(|q| !q.is_exhausted())
            {
                patch.status = Some(AccountStatus::Active);
                patch.cooldown_until = Some(None);
                info!(account_id = account.id, "quota replenished, account active again");
            }

            let updated = store
                .update_with_audit(account.id, patch, NewAuditEvent::new(actor, "refresh", "ok"))
                .await?;
            Ok(RefreshResult::Ok(Box::new(updated)))
        }
        Err(RefreshError::Rejected { status, detail }) => {
            warn!(account_id = account.id, status, "refresh token rejected, blocking account");
            store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        status: Some(AccountStatus::Blocked),
                        bump_error_count: true,
                        last_error: Some(Some(("refresh_rejected".into(), detail))),
                        last_check_at: Some(now),
                        ..Default::default()
                    },
                    NewAuditEvent::new(actor, "refresh", "refresh_rejected"),
                )
                .await?;
            Ok(RefreshResult::Rejected)
        }
        Err(RefreshError::QuotaExhausted { detail }) => {
            let until = now + chrono::Duration::from_std(cooldown_long).unwrap_or_default();
            store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        status: Some(AccountStatus::QuotaExhausted),
                        cooldown_until: Some(Some(until)),
                        bump_error_count: true,
                        last_error: Some(Some(("quota_exhausted".into(), detail))),
                        last_check_at: Some(now),
                        ..Default::default()
                    },
                    NewAuditEvent::new(actor, "refresh", "quota_exhausted"),
                )
                .await?;
            Ok(RefreshResult::QuotaExhausted)
        }
        Err(RefreshError::Transient { status, detail }) => {
            store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        bump_error_count: true,
                        last_error: Some(Some((
                            "refresh_transient".into(),
                            format!("{status}: {detail}"),
                        ))),
                        last_check_at: Some(now),
                        ..Default::default()
                    },
                    NewAuditEvent::new(actor, "refresh", "refresh_transient"),
                )
                .await?;
            Ok(RefreshResult::Transient)
        }
        Err(RefreshError::Network(detail)) => {
            store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        bump_error_count: true,
                        last_error: Some(Some(("network".into(), detail))),
                        last_check_at: Some(now),
                        ..Default::default()
                    },
                    NewAuditEvent::new(actor, "refresh", "network"),
                )
                .await?;
            Ok(RefreshResult::Network)
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted seam implementations shared by the pool tests.

    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use chrono::Utc;
    use futures_util::stream;

    use warp_auth::{Quota, RefreshError, RefreshGrant};
    use warp_codec::{EventStream, WarpEvent};
    use warp_transport::TransportError;

    use crate::{Refresher, Upstream};

    pub fn grant(access_token: &str) -> RefreshGrant {
        RefreshGrant {
            access_token: access_token.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            refresh_token: None,
            quota: None,
        }
    }

    pub fn grant_with_quota(access_token: &str, limit: i64, used: i64) -> RefreshGrant {
        RefreshGrant {
            quota: Some(Quota {
                limit,
                used,
                next_refresh_at: None,
                refresh_seconds: Some(3600),
                is_unlimited: false,
            }),
            ..grant(access_token)
        }
    }

    /// Pops scripted results; falls back to a plain grant when empty.
    #[derive(Default)]
    pub struct ScriptedRefresher {
        results: Mutex<VecDeque<Result<RefreshGrant, RefreshError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedRefresher {
        pub fn scripted(
            results: impl IntoIterator<Item = Result<RefreshGrant, RefreshError>>,
        ) -> Self {
            Self {
                results: Mutex::new(results.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Refresher for ScriptedRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<RefreshGrant, RefreshError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.results
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(grant("at_default")))
            })
        }
    }

    /// One scripted upstream attempt.
    pub enum SendScript {
        Events(Vec<WarpEvent>),
        Fail(TransportError),
    }

    /// Pops scripted sends and records the bearer token of each call.
    #[derive(Default)]
    pub struct ScriptedUpstream {
        scripts: Mutex<VecDeque<SendScript>>,
        pub tokens_seen: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        pub fn scripted(scripts: impl IntoIterator<Item = SendScript>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.tokens_seen.lock().unwrap().len()
        }
    }

    impl Upstream for ScriptedUpstream {
        fn send<'a>(
            &'a self,
            access_token: &'a str,
            _request: Bytes,
        ) -> Pin<Box<dyn Future<Output = Result<EventStream, TransportError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.tokens_seen
                    .lock()
                    .unwrap()
                    .push(access_token.to_string());
                let script = self.scripts.lock().unwrap().pop_front();
                match script {
                    Some(SendScript::Fail(err)) => Err(err),
                    Some(SendScript::Events(events)) => {
                        Ok(Box::pin(stream::iter(events)) as EventStream)
                    }
                    None => Ok(Box::pin(stream::iter(default_events())) as EventStream),
                }
            })
        }
    }

    fn default_events() -> Vec<WarpEvent> {
        vec![
            WarpEvent::Text {
                content: "ok".into(),
            },
            WarpEvent::End {
                reason: "stop".into(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use warp_auth::RefreshGrant;
    use warp_store::{AuditFilter, CryptoBox, InsertOutcome};

    async fn store_with_account(
        dir: &tempfile::TempDir,
    ) -> (AccountStore, Account) {
        let store = AccountStore::open(dir.path().join("r.db"), CryptoBox::from_key([5u8; 32]))
            .await
            .unwrap();
        let account = match store.insert("rt_refresh", None, None).await.unwrap() {
            InsertOutcome::Inserted(a) => a,
            _ => unreachable!(),
        };
        (store, account)
    }

    #[tokio::test]
    async fn success_persists_token_and_resets_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;
        // Seed an error count to confirm the reset.
        store
            .update_with_audit(
                account.id,
                AccountPatch {
                    bump_error_count: true,
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "network"),
            )
            .await
            .unwrap();

        let refresher = ScriptedRefresher::scripted([Ok(grant_with_quota("at_new", 100, 10))]);
        let result = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        let updated = match result {
            RefreshResult::Ok(a) => a,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(updated.access_token.as_deref(), Some("at_new"));
        assert!(updated.access_expires_at.unwrap() > Utc::now());
        assert_eq!(updated.error_count, 0);
        assert!(updated.last_success_at.is_some());
        assert_eq!(updated.quota.as_ref().unwrap().limit, 100);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_resealed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;

        let rotated = RefreshGrant {
            refresh_token: Some("rt_rotated".into()),
            ..grant("at_rot")
        };
        let refresher = ScriptedRefresher::scripted([Ok(rotated)]);
        refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

        let updated = store.get(account.id).await.unwrap().unwrap();
        assert_eq!(
            store.decrypt_refresh_token(&updated).unwrap().expose_str(),
            "rt_rotated"
        );
        // Fingerprint keeps the import lineage.
        assert_eq!(updated.fingerprint, account.fingerprint);
    }

    #[tokio::test]
    async fn rejected_refresh_blocks_account() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;

        let refresher = ScriptedRefresher::scripted([Err(RefreshError::Rejected {
            status: 400,
            detail: "invalid_grant".into(),
        })]);
        let result = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert!(matches!(result, RefreshResult::Rejected));

        let updated = store.get(account.id).await.unwrap().unwrap();
        assert_eq!(updated.status, AccountStatus::Blocked);
        assert_eq!(updated.last_error_code.as_deref(), Some("refresh_rejected"));

        let events = store.list_audit(&AuditFilter::default(), 5).await.unwrap();
        assert_eq!(events[0].outcome, "refresh_rejected");
    }

    #[tokio::test]
    async fn exhausted_quota_parks_account_for_long_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;

        let refresher = ScriptedRefresher::scripted([Ok(grant_with_quota("at_q", 50, 50))]);
        let result = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Monitor,
            Duration::from_secs(7200),
        )
        .await
        .unwrap();
        assert!(matches!(result, RefreshResult::QuotaExhausted));

        let updated = store.get(account.id).await.unwrap().unwrap();
        assert_eq!(updated.status, AccountStatus::QuotaExhausted);
        let until = updated.cooldown_until.unwrap();
        let expected = Utc::now() + chrono::Duration::seconds(7200);
        assert!((until - expected).num_seconds().abs() < 5);
        // Token still persisted for when the window reopens.
        assert_eq!(updated.access_token.as_deref(), Some("at_q"));
    }

    #[tokio::test]
    async fn fresh_quota_restores_quota_exhausted_account() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;
        let parked = store
            .update_with_audit(
                account.id,
                AccountPatch {
                    status: Some(AccountStatus::QuotaExhausted),
                    cooldown_until: Some(Some(Utc::now() - chrono::Duration::seconds(10))),
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "quota_exhausted"),
            )
            .await
            .unwrap();

        let refresher = ScriptedRefresher::scripted([Ok(grant_with_quota("at_back", 50, 0))]);
        let result = refresh_account(
            &store,
            &refresher,
            &parked,
            AuditActor::Monitor,
            Duration::from_secs(7200),
        )
        .await
        .unwrap();
        assert!(matches!(result, RefreshResult::Ok(_)));

        let updated = store.get(account.id).await.unwrap().unwrap();
        assert_eq!(updated.status, AccountStatus::Active);
        assert!(updated.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn unlimited_quota_never_parks() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;

        let unlimited = RefreshGrant {
            quota: Some(Quota {
                limit: 0,
                used: 10_000,
                next_refresh_at: None,
                refresh_seconds: None,
                is_unlimited: true,
            }),
            ..grant("at_unlim")
        };
        let refresher = ScriptedRefresher::scripted([Ok(unlimited)]);
        let result = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(7200),
        )
        .await
        .unwrap();
        assert!(matches!(result, RefreshResult::Ok(_)));
        assert_eq!(
            store.get(account.id).await.unwrap().unwrap().status,
            AccountStatus::Active
        );
    }

    #[tokio::test]
    async fn transient_and_network_only_bump_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (store, account) = store_with_account(&dir).await;

        let refresher = ScriptedRefresher::scripted([
            Err(RefreshError::Transient {
                status: 502,
                detail: "bad gateway".into(),
            }),
            Err(RefreshError::Network("connection refused".into())),
        ]);

        let r1 = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert!(matches!(r1, RefreshResult::Transient));

        let account = store.get(account.id).await.unwrap().unwrap();
        let r2 = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Runtime,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert!(matches!(r2, RefreshResult::Network));

        let updated = store.get(account.id).await.unwrap().unwrap();
        assert_eq!(updated.status, AccountStatus::Active);
        assert_eq!(updated.error_count, 2);
    }

    #[tokio::test]
    async fn undecryptable_token_disables_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.db");
        let id = {
            let store = AccountStore::open(&path, CryptoBox::from_key([1u8; 32]))
                .await
                .unwrap();
            match store.insert("rt_lost_key", None, None).await.unwrap() {
                InsertOutcome::Inserted(a) => a.id,
                _ => unreachable!(),
            }
        };

        // Reopen under a different key: the sealed token can no longer open.
        let store = AccountStore::open(&path, CryptoBox::from_key([2u8; 32]))
            .await
            .unwrap();
        let account = store.get(id).await.unwrap().unwrap();
        let refresher = ScriptedRefresher::default();

        let result = refresh_account(
            &store,
            &refresher,
            &account,
            AuditActor::Monitor,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert!(matches!(result, RefreshResult::DecryptFailed));
        assert_eq!(refresher.call_count(), 0);

        let updated = store.get(id).await.unwrap().unwrap();
        assert_eq!(updated.status, AccountStatus::Disabled);
        assert_eq!(updated.last_error_code.as_deref(), Some("decrypt_failed"));
    }
}
