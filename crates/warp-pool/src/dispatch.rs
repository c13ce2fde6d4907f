//! Dispatch pipeline
//!
//! The single upstream channel. One dispatch walks the pool: select an
//! account, hold its lock, make sure an access token is on hand, send,
//! classify, transition, and either hand the stream to the caller or move
//! on to the next account. Per-attempt failures are absorbed into account
//! state; only the aggregate outcome propagates.
//!
//! Streaming classification is two-phase: the HTTP status and the first
//! event decide whether the attempt counts against the account budget; an
//! error event later in the stream never retries (the client already has
//! bytes) but still lands on the account's counters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use warp_codec::{EventStream, WarpEvent};
use warp_store::{Account, AccountPatch, AccountStatus, AccountStore, AuditActor, NewAuditEvent};

use crate::classify::{self, Outcome};
use crate::error::DispatchError;
use crate::locks::AccountLocks;
use crate::refresh::{RefreshResult, refresh_account};
use crate::select::{SelectorConfig, select_account};
use crate::{Refresher, Upstream};

/// Maximum error detail kept on the account row.
const DETAIL_LIMIT: usize = 512;

/// Dispatch tuning; every field maps to configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Distinct accounts tried per dispatch before giving up.
    pub max_accounts_per_request: usize,
    /// Cooldown for rate limits (without `Retry-After`) and repeated
    /// failures.
    pub cooldown_short: Duration,
    /// Cooldown for quota exhaustion.
    pub cooldown_long: Duration,
    /// Dispatch error-count threshold that converts repeated WAF/unknown
    /// failures into a cooldown.
    pub f_threshold: i64,
    /// Consecutive health-probe failures that make an account ineligible.
    pub h_fail_threshold: i64,
    /// Bounded wait when every eligible account's lock is busy.
    pub lock_wait: Duration,
    /// Refresh the access token when it expires within this window.
    pub access_token_skew: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_accounts_per_request: 3,
            cooldown_short: Duration::from_secs(300),
            cooldown_long: Duration::from_secs(3600),
            f_threshold: 3,
            h_fail_threshold: 3,
            lock_wait: Duration::from_secs(5),
            access_token_skew: Duration::from_secs(60),
        }
    }
}

/// Attempt categories for the aggregate error, per the caller taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    /// Could not produce an access token.
    Refresh,
    /// Terminal 4xx from the upstream.
    Rejected,
    /// Network failure or 5xx.
    Unreachable,
    /// Quota spent.
    Quota,
    /// Unclassified.
    Other,
}

/// The single-flight dispatcher; every adapter funnels through here.
pub struct Dispatcher {
    store: Arc<AccountStore>,
    locks: Arc<AccountLocks>,
    refresher: Arc<dyn Refresher>,
    upstream: Arc<dyn Upstream>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<AccountStore>,
        locks: Arc<AccountLocks>,
        refresher: Arc<dyn Refresher>,
        upstream: Arc<dyn Upstream>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            locks,
            refresher,
            upstream,
            config,
        }
    }

    /// One end-to-end attempt to fulfill a client request.
    pub async fn dispatch(
        &self,
        request: Bytes,
        model: &str,
    ) -> Result<EventStream, DispatchError> {
        let started = Instant::now();
        let result = self.run(request, model).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(DispatchError::Unavailable) => "unavailable",
            Err(DispatchError::AuthFailed) => "auth_failed",
            Err(DispatchError::UpstreamRejected) => "upstream_rejected",
            Err(DispatchError::UpstreamUnreachable) => "upstream_unreachable",
            Err(DispatchError::Store(_)) => "internal",
        };
        metrics::counter!("dispatch_requests_total", "outcome" => outcome).increment(1);
        metrics::histogram!("dispatch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, request: Bytes, model: &str) -> Result<EventStream, DispatchError> {
        let selector = SelectorConfig {
            h_fail_threshold: self.config.h_fail_threshold,
            lock_wait: self.config.lock_wait,
        };
        let mut excluded: HashSet<i64> = HashSet::new();
        let mut attempts: Vec<AttemptKind> = Vec::new();

        while excluded.len() < self.config.max_accounts_per_request {
            let selected = select_account(&self.store, &self.locks, &excluded, &selector).await?;
            let Some((mut account, guard)) = selected else {
                break;
            };
            excluded.insert(account.id);
            debug!(account_id = account.id, model, "dispatch attempt");

            // A usable access token first; stale or missing means refresh.
            let skew = chrono::Duration::from_std(self.config.access_token_skew)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            if !account.has_fresh_access_token(Utc::now(), skew) {
                match self.refresh(&account).await? {
                    RefreshResult::Ok(updated) => account = *updated,
                    other => {
                        record_attempt(other.label());
                        attempts.push(match other {
                            RefreshResult::QuotaExhausted => AttemptKind::Quota,
                            _ => AttemptKind::Refresh,
                        });
                        continue;
                    }
                }
            }
            let Some(mut access_token) = account.access_token.clone() else {
                attempts.push(AttemptKind::Refresh);
                continue;
            };

            let mut auth_retry_done = false;
            loop {
                match self.upstream.send(&access_token, request.clone()).await {
                    Ok(upstream_stream) => {
                        let (first, rest) = peek(upstream_stream).await;
                        match first {
                            Some(WarpEvent::Error { code, message }) => {
                                // Error before any payload: charge the
                                // account and move on.
                                let outcome = classify::classify_error_event(&code, &message);
                                record_attempt(outcome.label());
                                apply_failure(
                                    &self.store,
                                    &self.config,
                                    &account,
                                    &outcome,
                                    "dispatch",
                                    &message,
                                )
                                .await?;
                                attempts.push(kind_for(&outcome));
                                break;
                            }
                            Some(first_event) => {
                                self.record_success(&account).await?;
                                record_attempt("ok");
                                info!(account_id = account.id, model, "dispatch served");
                                return Ok(self.monitored_stream(
                                    first_event,
                                    rest,
                                    account.id,
                                    guard,
                                ));
                            }
                            None => {
                                record_attempt("unknown");
                                apply_failure(
                                    &self.store,
                                    &self.config,
                                    &account,
                                    &Outcome::Unknown,
                                    "dispatch",
                                    "stream ended before any event",
                                )
                                .await?;
                                attempts.push(AttemptKind::Other);
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        let outcome = classify::classify_send_failure(&err);
                        if outcome == Outcome::AuthExpired && !auth_retry_done {
                            auth_retry_done = true;
                            debug!(account_id = account.id, "access token expired, refreshing for retry");
                            match self.refresh(&account).await? {
                                RefreshResult::Ok(updated) => {
                                    account = *updated;
                                    if let Some(token) = account.access_token.clone() {
                                        access_token = token;
                                        continue;
                                    }
                                    attempts.push(AttemptKind::Refresh);
                                    break;
                                }
                                other => {
                                    record_attempt(other.label());
                                    attempts.push(match other {
                                        RefreshResult::QuotaExhausted => AttemptKind::Quota,
                                        _ => AttemptKind::Refresh,
                                    });
                                    break;
                                }
                            }
                        }
                        record_attempt(outcome.label());
                        apply_failure(
                            &self.store,
                            &self.config,
                            &account,
                            &outcome,
                            "dispatch",
                            &err.to_string(),
                        )
                        .await?;
                        attempts.push(kind_for(&outcome));
                        break;
                    }
                }
            }
            // Lock guard drops here; the account is free for other work.
        }

        Err(aggregate(&attempts))
    }

    async fn refresh(&self, account: &Account) -> Result<RefreshResult, warp_store::Error> {
        refresh_account(
            &self.store,
            self.refresher.as_ref(),
            account,
            AuditActor::Runtime,
            self.config.cooldown_long,
        )
        .await
    }

    async fn record_success(&self, account: &Account) -> Result<(), warp_store::Error> {
        let now = Utc::now();
        self.store
            .update_with_audit(
                account.id,
                AccountPatch {
                    bump_use_count: true,
                    reset_error_count: true,
                    reset_consecutive_failures: true,
                    last_error: Some(None),
                    last_success_at: Some(now),
                    last_check_at: Some(now),
                    ..Default::default()
                },
                NewAuditEvent::new(AuditActor::Runtime, "dispatch", "ok"),
            )
            .await?;
        Ok(())
    }

    /// Re-assemble the peeked stream and watch it for mid-stream errors.
    ///
    /// The lock guard rides inside the stream state: dropping the stream
    /// (client disconnect included) releases the account.
    fn monitored_stream(
        &self,
        first: WarpEvent,
        rest: EventStream,
        account_id: i64,
        guard: OwnedMutexGuard<()>,
    ) -> EventStream {
        struct MonitorState {
            first: Option<WarpEvent>,
            rest: EventStream,
            store: Arc<AccountStore>,
            config: DispatchConfig,
            account_id: i64,
            error_reported: bool,
            _guard: OwnedMutexGuard<()>,
        }

        let state = MonitorState {
            first: Some(first),
            rest,
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            account_id,
            error_reported: false,
            _guard: guard,
        };

        Box::pin(stream::unfold(state, |mut st| async move {
            let event = match st.first.take() {
                Some(event) => Some(event),
                None => st.rest.next().await,
            }?;

            if let WarpEvent::Error { code, message } = &event
                && !st.error_reported
            {
                st.error_reported = true;
                warn!(
                    account_id = st.account_id,
                    code = %code,
                    "mid-stream upstream error"
                );
                metrics::counter!("dispatch_stream_errors_total").increment(1);
                // The client already received bytes: no retry, but the
                // account still answers for the failure.
                let store = Arc::clone(&st.store);
                let config = st.config.clone();
                let account_id = st.account_id;
                let outcome = classify::classify_error_event(code, message);
                let message = message.clone();
                tokio::spawn(async move {
                    let account = match store.get(account_id).await {
                        Ok(Some(account)) => account,
                        Ok(None) => return,
                        Err(e) => {
                            warn!(error = %e, "mid-stream error bookkeeping failed");
                            return;
                        }
                    };
                    if let Err(e) = apply_failure(
                        &store,
                        &config,
                        &account,
                        &outcome,
                        "stream_error",
                        &message,
                    )
                    .await
                    {
                        warn!(error = %e, "mid-stream error bookkeeping failed");
                    }
                });
            }

            Some((event, st))
        }))
    }
}

async fn peek(mut stream: EventStream) -> (Option<WarpEvent>, EventStream) {
    let first = stream.next().await;
    (first, stream)
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("dispatch_attempts_total", "outcome" => outcome).increment(1);
}

fn kind_for(outcome: &Outcome) -> AttemptKind {
    match outcome {
        Outcome::RateLimited { .. } | Outcome::ForbiddenWaf => AttemptKind::Rejected,
        Outcome::QuotaExhausted => AttemptKind::Quota,
        Outcome::Network | Outcome::ServerError => AttemptKind::Unreachable,
        Outcome::Ok | Outcome::AuthExpired | Outcome::Unknown => AttemptKind::Other,
    }
}

/// Map the attempt record onto the caller taxonomy. Mixed failure kinds
/// degrade to `Unavailable`, the honest "try again later".
fn aggregate(attempts: &[AttemptKind]) -> DispatchError {
    if attempts.is_empty() {
        return DispatchError::Unavailable;
    }
    if attempts.iter().all(|k| *k == AttemptKind::Refresh) {
        return DispatchError::AuthFailed;
    }
    if attempts.iter().all(|k| *k == AttemptKind::Rejected) {
        return DispatchError::UpstreamRejected;
    }
    if attempts.iter().all(|k| *k == AttemptKind::Unreachable) {
        return DispatchError::UpstreamUnreachable;
    }
    DispatchError::Unavailable
}

/// Apply the state-transition table for one failed attempt.
async fn apply_failure(
    store: &AccountStore,
    config: &DispatchConfig,
    account: &Account,
    outcome: &Outcome,
    action: &str,
    detail: &str,
) -> Result<(), warp_store::Error> {
    let now = Utc::now();
    let label = outcome.label();
    let mut detail = detail.to_string();
    if detail.len() > DETAIL_LIMIT {
        let mut end = DETAIL_LIMIT;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        detail.truncate(end);
    }

    let mut patch = AccountPatch {
        last_check_at: Some(now),
        last_error: Some(Some((label.to_string(), detail))),
        ..Default::default()
    };

    match outcome {
        Outcome::ForbiddenWaf | Outcome::Unknown => {
            patch.bump_error_count = true;
            if account.error_count + 1 >= config.f_threshold {
                patch.status = Some(AccountStatus::Cooldown);
                patch.cooldown_until = Some(Some(
                    now + chrono::Duration::from_std(config.cooldown_short).unwrap_or_default(),
                ));
            }
        }
        Outcome::RateLimited { retry_after } => {
            let backoff = retry_after
                .map(Duration::from_secs)
                .unwrap_or(config.cooldown_short);
            patch.bump_error_count = true;
            patch.status = Some(AccountStatus::Cooldown);
            patch.cooldown_until =
                Some(Some(now + chrono::Duration::from_std(backoff).unwrap_or_default()));
        }
        Outcome::QuotaExhausted => {
            patch.bump_error_count = true;
            patch.status = Some(AccountStatus::QuotaExhausted);
            patch.cooldown_until = Some(Some(
                now + chrono::Duration::from_std(config.cooldown_long).unwrap_or_default(),
            ));
        }
        Outcome::Network | Outcome::ServerError => {
            patch.bump_error_count = true;
        }
        Outcome::Ok | Outcome::AuthExpired => return Ok(()),
    }

    store
        .update_with_audit(
            account.id,
            patch,
            NewAuditEvent::new(AuditActor::Runtime, action, label),
        )
        .await?;
    Ok(())
}
