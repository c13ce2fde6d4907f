//! Background health monitor
//!
//! One periodic pass over the pool: probe each account's refresh path,
//! record a health snapshot with latency, and demote accounts that keep
//! failing. At most one pass runs at a time; locks are taken
//! opportunistically so a probe never delays live traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warp_store::{
    Account, AccountPatch, AccountStatus, AccountStore, AuditActor, HealthSnapshot, NewAuditEvent,
};

use crate::Refresher;
use crate::locks::AccountLocks;
use crate::refresh::{RefreshResult, refresh_account};

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Per-account probe deadline.
    pub probe_timeout: Duration,
    /// Consecutive failures that demote an `active` account.
    pub h_fail_threshold: i64,
    /// Cooldown applied on demotion.
    pub cooldown_short: Duration,
    /// Cooldown applied on quota exhaustion.
    pub cooldown_long: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(20),
            h_fail_threshold: 3,
            cooldown_short: Duration::from_secs(300),
            cooldown_long: Duration::from_secs(3600),
        }
    }
}

/// Periodic prober bound to the application lifecycle: started after the
/// store opens, stopped (cooperatively) before it closes.
pub struct HealthMonitor {
    store: Arc<AccountStore>,
    locks: Arc<AccountLocks>,
    refresher: Arc<dyn Refresher>,
    config: MonitorConfig,
    pass_lock: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<AccountStore>,
        locks: Arc<AccountLocks>,
        refresher: Arc<dyn Refresher>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks,
            refresher,
            config,
            pass_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn the periodic loop. Flipping `shutdown` to `true` stops it
    /// after the in-flight probe (bounded by the probe timeout).
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            // The pool was just loaded; skip the immediate tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_pass().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("health monitor stopped");
        })
    }

    /// One full sweep across the tracked accounts.
    ///
    /// Re-entrant calls collapse: a pass still running when the next tick
    /// fires makes the tick a no-op.
    pub async fn run_pass(&self) {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("health pass already running, skipping tick");
            return;
        };

        let accounts = match self.store.list().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "health pass could not list accounts");
                return;
            }
        };

        let mut probed = 0usize;
        for account in &accounts {
            if !self.probe_worthy(account) {
                continue;
            }
            // Opportunistic: a mid-send account is demonstrably alive.
            let Some(_guard) = self.locks.try_acquire(account.id) else {
                debug!(account_id = account.id, "account busy, skipping probe");
                continue;
            };
            self.probe(account).await;
            probed += 1;
        }
        metrics::counter!("health_passes_total").increment(1);
        debug!(total = accounts.len(), probed, "health pass complete");
    }

    /// `active` and `cooldown` are probed every pass; `quota_exhausted`
    /// only once its window has elapsed, to see whether quota returned.
    fn probe_worthy(&self, account: &Account) -> bool {
        match account.status {
            AccountStatus::Active | AccountStatus::Cooldown => true,
            AccountStatus::QuotaExhausted => account.cooldown_elapsed(Utc::now()),
            AccountStatus::Blocked | AccountStatus::Disabled => false,
        }
    }

    async fn probe(&self, account: &Account) {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.probe_timeout,
            refresh_account(
                &self.store,
                self.refresher.as_ref(),
                account,
                AuditActor::Monitor,
                self.config.cooldown_long,
            ),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let (healthy, last_error) = match &result {
            Ok(Ok(RefreshResult::Ok(_))) => (true, None),
            Ok(Ok(outcome)) => (false, Some(outcome.label().to_string())),
            Ok(Err(e)) => {
                warn!(account_id = account.id, error = %e, "health probe store failure");
                (false, Some(e.to_string()))
            }
            Err(_) => (false, Some("probe timeout".to_string())),
        };

        let previous = self.store.read_health(account.id).await.ok().flatten();
        let consecutive_failures = if healthy {
            0
        } else {
            previous.as_ref().map(|s| s.consecutive_failures).unwrap_or(0) + 1
        };
        let now = Utc::now();

        let snapshot = HealthSnapshot {
            account_id: account.id,
            healthy: Some(healthy),
            last_checked_at: now,
            last_success_at: if healthy {
                Some(now)
            } else {
                previous.and_then(|s| s.last_success_at)
            },
            consecutive_failures,
            latency_ms: Some(latency_ms),
            last_error,
        };
        if let Err(e) = self.store.snapshot_health(&snapshot).await {
            warn!(account_id = account.id, error = %e, "failed to write health snapshot");
        }
        metrics::counter!("health_probes_total", "healthy" => if healthy { "true" } else { "false" })
            .increment(1);

        // Demotion: an active account that keeps failing its probes gets a
        // short cooldown rather than soaking dispatch attempts.
        if !healthy
            && consecutive_failures >= self.config.h_fail_threshold
            && account.status == AccountStatus::Active
        {
            let until = now
                + chrono::Duration::from_std(self.config.cooldown_short).unwrap_or_default();
            info!(
                account_id = account.id,
                consecutive_failures, "demoting account after repeated probe failures"
            );
            if let Err(e) = self
                .store
                .update_with_audit(
                    account.id,
                    AccountPatch {
                        status: Some(AccountStatus::Cooldown),
                        cooldown_until: Some(Some(until)),
                        ..Default::default()
                    },
                    NewAuditEvent::new(AuditActor::Monitor, "health", "demoted"),
                )
                .await
            {
                warn!(account_id = account.id, error = %e, "failed to demote account");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::testutil::*;
    use warp_auth::RefreshError;
    use warp_store::{CryptoBox, InsertOutcome};

    struct Rig {
        store: Arc<AccountStore>,
        locks: Arc<AccountLocks>,
    }

    async fn rig(dir: &tempfile::TempDir, tokens: &[&str]) -> Rig {
        let store = Arc::new(
            AccountStore::open(dir.path().join("h.db"), CryptoBox::from_key([6u8; 32]))
                .await
                .unwrap(),
        );
        for token in tokens {
            match store.insert(token, None, None).await.unwrap() {
                InsertOutcome::Inserted(_) => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        Rig {
            store,
            locks: Arc::new(AccountLocks::new()),
        }
    }

    fn monitor(r: &Rig, refresher: ScriptedRefresher, config: MonitorConfig) -> Arc<HealthMonitor> {
        HealthMonitor::new(
            Arc::clone(&r.store),
            Arc::clone(&r.locks),
            Arc::new(refresher) as Arc<dyn Refresher>,
            config,
        )
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(2),
            h_fail_threshold: 2,
            cooldown_short: Duration::from_secs(300),
            cooldown_long: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn healthy_probe_writes_snapshot_with_latency() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a"]).await;
        let id = r.store.list().await.unwrap()[0].id;

        let m = monitor(&r, ScriptedRefresher::default(), fast_config());
        m.run_pass().await;

        let snapshot = r.store.read_health(id).await.unwrap().unwrap();
        assert_eq!(snapshot.healthy, Some(true));
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.latency_ms.is_some());
        assert!(snapshot.last_success_at.is_some());
    }

    #[tokio::test]
    async fn failing_probes_accumulate_then_demote() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a"]).await;
        let id = r.store.list().await.unwrap()[0].id;

        let transient = || {
            Err(RefreshError::Transient {
                status: 503,
                detail: "down".into(),
            })
        };
        let m = monitor(
            &r,
            ScriptedRefresher::scripted([transient(), transient()]),
            fast_config(),
        );

        m.run_pass().await;
        let s1 = r.store.read_health(id).await.unwrap().unwrap();
        assert_eq!(s1.healthy, Some(false));
        assert_eq!(s1.consecutive_failures, 1);
        assert_eq!(
            r.store.get(id).await.unwrap().unwrap().status,
            AccountStatus::Active
        );

        // Second consecutive failure crosses h_fail_threshold = 2.
        m.run_pass().await;
        let s2 = r.store.read_health(id).await.unwrap().unwrap();
        assert_eq!(s2.consecutive_failures, 2);
        let account = r.store.get(id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Cooldown);
        assert!(account.cooldown_until.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn recovery_resets_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a"]).await;
        let id = r.store.list().await.unwrap()[0].id;

        let m = monitor(
            &r,
            ScriptedRefresher::scripted([
                Err(RefreshError::Network("refused".into())),
                Ok(grant("at_back")),
            ]),
            fast_config(),
        );

        m.run_pass().await;
        assert_eq!(
            r.store
                .read_health(id)
                .await
                .unwrap()
                .unwrap()
                .consecutive_failures,
            1
        );

        m.run_pass().await;
        let snapshot = r.store.read_health(id).await.unwrap().unwrap();
        assert_eq!(snapshot.healthy, Some(true));
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn blocked_and_disabled_accounts_are_not_probed() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a", "rt_b"]).await;
        let ids: Vec<i64> = r.store.list().await.unwrap().iter().map(|a| a.id).collect();
        for (id, status) in [
            (ids[0], AccountStatus::Blocked),
            (ids[1], AccountStatus::Disabled),
        ] {
            r.store
                .update_with_audit(
                    id,
                    AccountPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                    NewAuditEvent::new(AuditActor::Admin, "patch", status.as_str()),
                )
                .await
                .unwrap();
        }

        let refresher = Arc::new(ScriptedRefresher::default());
        let m = HealthMonitor::new(
            Arc::clone(&r.store),
            Arc::clone(&r.locks),
            Arc::clone(&refresher) as Arc<dyn Refresher>,
            fast_config(),
        );
        m.run_pass().await;

        assert_eq!(refresher.call_count(), 0);
        assert!(r.store.read_health(ids[0]).await.unwrap().is_none());
        assert!(r.store.read_health(ids[1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn busy_account_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a"]).await;
        let id = r.store.list().await.unwrap()[0].id;
        let _held = r.locks.try_acquire(id).unwrap();

        let m = monitor(&r, ScriptedRefresher::default(), fast_config());
        m.run_pass().await;

        assert!(r.store.read_health(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_exhausted_probed_only_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &["rt_a"]).await;
        let id = r.store.list().await.unwrap()[0].id;

        // Still inside the window: not probed.
        r.store
            .update_with_audit(
                id,
                AccountPatch {
                    status: Some(AccountStatus::QuotaExhausted),
                    cooldown_until: Some(Some(Utc::now() + chrono::Duration::hours(1))),
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "quota_exhausted"),
            )
            .await
            .unwrap();
        let m = monitor(&r, ScriptedRefresher::default(), fast_config());
        m.run_pass().await;
        assert!(r.store.read_health(id).await.unwrap().is_none());

        // Window elapsed and quota back: probe restores the account.
        r.store
            .update_with_audit(
                id,
                AccountPatch {
                    cooldown_until: Some(Some(Utc::now() - chrono::Duration::seconds(1))),
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "quota_exhausted"),
            )
            .await
            .unwrap();
        let m = monitor(
            &r,
            ScriptedRefresher::scripted([Ok(grant_with_quota("at_back", 100, 5))]),
            fast_config(),
        );
        m.run_pass().await;

        let account = r.store.get(id).await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        assert!(account.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown_signal() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(&dir, &[]).await;
        let m = monitor(&r, ScriptedRefresher::default(), fast_config());

        let (tx, rx) = watch::channel(false);
        let handle = m.spawn(rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
