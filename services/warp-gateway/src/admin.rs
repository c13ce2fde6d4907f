//! Admin API for account management
//!
//! Mounted under `/admin/api`. Every mutating route writes an audit event
//! with `actor = admin`; no response ever carries a complete refresh
//! token. Authorization is a bearer token compared in constant time, with
//! a loopback bypass in `local` mode and no check in `off` mode.
//!
//! Endpoints:
//! - GET    /admin/api/tokens                — list accounts (masked)
//! - POST   /admin/api/tokens/batch-import   — dedup-import tokens
//! - PATCH  /admin/api/tokens/{id}           — mutate status/label
//! - DELETE /admin/api/tokens/{id}           — remove account
//! - POST   /admin/api/tokens/batch-delete   — remove many
//! - POST   /admin/api/tokens/{id}/refresh   — force refresh one
//! - POST   /admin/api/tokens/refresh-all    — force refresh pool
//! - GET    /admin/api/tokens/statistics     — counts by status/health
//! - GET    /admin/api/tokens/health         — last health snapshots
//! - GET    /admin/api/tokens/readiness      — readiness reporter
//! - GET    /admin/api/tokens/events         — paged audit log

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use common::{Secret, mask_token};
use warp_pool::{AccountLocks, Refresher, refresh_account, readiness};
use warp_store::{
    Account, AccountPatch, AccountStatus, AccountStore, AuditActor, AuditFilter, ImportEntry,
    NewAuditEvent, QuotaSnapshot,
};

use crate::config::AdminAuthMode;

/// Bound on one audit-log page.
const MAX_EVENT_PAGE: u32 = 500;

/// Wait for a busy account before a forced refresh gives up.
const FORCE_REFRESH_WAIT: Duration = Duration::from_secs(2);

/// Authorization gate configuration.
#[derive(Clone)]
pub struct AdminAuth {
    pub mode: AdminAuthMode,
    pub token: Option<Secret<String>>,
}

impl AdminAuth {
    fn authorize(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> bool {
        match self.mode {
            AdminAuthMode::Off => true,
            AdminAuthMode::Local if peer.is_some_and(|p| p.ip().is_loopback()) => true,
            AdminAuthMode::Local | AdminAuthMode::Token => {
                let provided = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "));
                match (provided, &self.token) {
                    (Some(provided), Some(expected)) => {
                        use subtle::ConstantTimeEq;
                        provided
                            .as_bytes()
                            .ct_eq(expected.expose_str().as_bytes())
                            .into()
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<AccountStore>,
    pub locks: Arc<AccountLocks>,
    pub refresher: Arc<dyn Refresher>,
    pub auth: AdminAuth,
    pub h_fail_threshold: i64,
    pub cooldown_long: Duration,
}

/// Build the admin router with every account-management endpoint.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/api/tokens", get(list_tokens))
        .route("/admin/api/tokens/batch-import", post(batch_import))
        .route("/admin/api/tokens/batch-delete", post(batch_delete))
        .route("/admin/api/tokens/refresh-all", post(refresh_all))
        .route("/admin/api/tokens/statistics", get(statistics))
        .route("/admin/api/tokens/health", get(health_snapshots))
        .route("/admin/api/tokens/readiness", get(readiness_report))
        .route("/admin/api/tokens/events", get(audit_events))
        .route(
            "/admin/api/tokens/{id}",
            patch(patch_token).delete(delete_token),
        )
        .route("/admin/api/tokens/{id}/refresh", post(refresh_one))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}

async fn require_admin(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    if state.auth.authorize(request.headers(), peer) {
        next.run(request).await
    } else {
        envelope_err(StatusCode::UNAUTHORIZED, "admin authorization required").into_response()
    }
}

// ── response envelope ──────────────────────────────────────────────────

fn envelope_ok(data: Value) -> (StatusCode, axum::Json<Value>) {
    (
        StatusCode::OK,
        axum::Json(json!({ "success": true, "data": data })),
    )
}

fn envelope_err(status: StatusCode, detail: &str) -> (StatusCode, axum::Json<Value>) {
    (
        status,
        axum::Json(json!({ "success": false, "detail": detail })),
    )
}

fn store_failure(e: warp_store::Error) -> (StatusCode, axum::Json<Value>) {
    warn!(error = %e, "admin store operation failed");
    envelope_err(StatusCode::INTERNAL_SERVER_ERROR, "store operation failed")
}

// ── views ──────────────────────────────────────────────────────────────

/// Operator-facing account projection; the refresh token appears only as
/// `{prefix}…{suffix}`.
#[derive(Serialize)]
struct AccountView {
    id: i64,
    label: Option<String>,
    email: Option<String>,
    token: String,
    status: AccountStatus,
    use_count: i64,
    error_count: i64,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    last_check_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    access_token_expires_at: Option<DateTime<Utc>>,
    quota: Option<QuotaSnapshot>,
    created_at: DateTime<Utc>,
}

fn account_view(store: &AccountStore, account: &Account) -> AccountView {
    let token = match store.decrypt_refresh_token(account) {
        Ok(secret) => mask_token(secret.expose_str()),
        Err(_) => "…".to_string(),
    };
    AccountView {
        id: account.id,
        label: account.label.clone(),
        email: account.email.clone(),
        token,
        status: account.status,
        use_count: account.use_count,
        error_count: account.error_count,
        last_error_code: account.last_error_code.clone(),
        last_error_message: account.last_error_message.clone(),
        last_success_at: account.last_success_at,
        last_check_at: account.last_check_at,
        cooldown_until: account.cooldown_until,
        access_token_expires_at: account.access_expires_at,
        quota: account.quota.clone(),
        created_at: account.created_at,
    }
}

// ── handlers ───────────────────────────────────────────────────────────

async fn list_tokens(State(state): State<AdminState>) -> impl IntoResponse {
    match state.store.list().await {
        Ok(accounts) => {
            let views: Vec<AccountView> = accounts
                .iter()
                .map(|a| account_view(&state.store, a))
                .collect();
            envelope_ok(json!({ "accounts": views }))
        }
        Err(e) => store_failure(e),
    }
}

/// Accepts `{"tokens": ["…"]}` or `{"accounts": [{"refresh_token": "…"}]}`,
/// or both at once.
#[derive(Deserialize)]
struct BatchImportBody {
    #[serde(default)]
    tokens: Vec<String>,
    #[serde(default)]
    accounts: Vec<ImportEntry>,
}

async fn batch_import(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BatchImportBody>,
) -> impl IntoResponse {
    let mut entries = body.accounts;
    entries.extend(body.tokens.into_iter().map(|refresh_token| ImportEntry {
        refresh_token,
        label: None,
        email: None,
    }));
    if entries.is_empty() {
        return envelope_err(StatusCode::BAD_REQUEST, "no tokens or accounts provided");
    }

    match state.store.batch_import(&entries).await {
        Ok(report) => {
            info!(
                inserted = report.inserted,
                duplicates = report.duplicates,
                errors = report.errors,
                "batch import complete"
            );
            envelope_ok(json!(report))
        }
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
struct PatchBody {
    status: Option<String>,
    label: Option<String>,
}

async fn patch_token(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    axum::Json(body): axum::Json<PatchBody>,
) -> impl IntoResponse {
    let account = match state.store.get(id).await {
        Ok(Some(account)) => account,
        Ok(None) => return envelope_err(StatusCode::NOT_FOUND, "account not found"),
        Err(e) => return store_failure(e),
    };

    let mut patch = AccountPatch::default();
    let mut outcome = Vec::new();

    if let Some(raw) = &body.status {
        let Some(status) = AccountStatus::parse(raw) else {
            return envelope_err(StatusCode::BAD_REQUEST, "unknown status");
        };
        // Operators move accounts between active, disabled, and blocked;
        // cooldown and quota_exhausted belong to the runtime.
        if !matches!(
            status,
            AccountStatus::Active | AccountStatus::Disabled | AccountStatus::Blocked
        ) {
            return envelope_err(
                StatusCode::BAD_REQUEST,
                "status must be one of active, disabled, blocked",
            );
        }
        if status != account.status {
            patch.status = Some(status);
            if status == AccountStatus::Active {
                patch.cooldown_until = Some(None);
                patch.last_error = Some(None);
            }
            outcome.push(format!("status={}", status.as_str()));
        }
    }
    if let Some(label) = &body.label
        && account.label.as_deref() != Some(label.as_str())
    {
        patch.label = Some(Some(label.clone()));
        outcome.push("label".to_string());
    }

    if outcome.is_empty() {
        // Patching to the current value is a no-op.
        return envelope_ok(json!({ "account": account_view(&state.store, &account) }));
    }

    match state
        .store
        .update_with_audit(
            id,
            patch,
            NewAuditEvent::new(AuditActor::Admin, "patch", &outcome.join(",")),
        )
        .await
    {
        Ok(updated) => {
            info!(account_id = id, changes = %outcome.join(","), "admin patched account");
            envelope_ok(json!({ "account": account_view(&state.store, &updated) }))
        }
        Err(e) => store_failure(e),
    }
}

async fn delete_token(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state
        .store
        .delete(
            id,
            NewAuditEvent::new(AuditActor::Admin, "delete", "removed"),
        )
        .await
    {
        Ok(existed) => {
            info!(account_id = id, existed, "admin deleted account");
            envelope_ok(json!({ "deleted": existed }))
        }
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
struct BatchDeleteBody {
    ids: Vec<i64>,
}

async fn batch_delete(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BatchDeleteBody>,
) -> impl IntoResponse {
    match state.store.batch_delete(&body.ids).await {
        Ok(removed) => envelope_ok(json!({ "removed": removed })),
        Err(e) => store_failure(e),
    }
}

async fn refresh_one(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let account = match state.store.get(id).await {
        Ok(Some(account)) => account,
        Ok(None) => return envelope_err(StatusCode::NOT_FOUND, "account not found"),
        Err(e) => return store_failure(e),
    };
    let Some(_guard) = state.locks.acquire_timeout(id, FORCE_REFRESH_WAIT).await else {
        return envelope_err(StatusCode::CONFLICT, "account is busy");
    };

    match refresh_account(
        &state.store,
        state.refresher.as_ref(),
        &account,
        AuditActor::Admin,
        state.cooldown_long,
    )
    .await
    {
        Ok(result) => {
            let refreshed = state.store.get(id).await.ok().flatten();
            envelope_ok(json!({
                "outcome": result.label(),
                "account": refreshed.map(|a| account_view(&state.store, &a)),
            }))
        }
        Err(e) => store_failure(e),
    }
}

async fn refresh_all(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = match state.store.list().await {
        Ok(accounts) => accounts,
        Err(e) => return store_failure(e),
    };

    let mut outcomes = Vec::new();
    for account in &accounts {
        let Some(_guard) = state.locks.try_acquire(account.id) else {
            outcomes.push(json!({ "id": account.id, "outcome": "busy" }));
            continue;
        };
        match refresh_account(
            &state.store,
            state.refresher.as_ref(),
            account,
            AuditActor::Admin,
            state.cooldown_long,
        )
        .await
        {
            Ok(result) => outcomes.push(json!({ "id": account.id, "outcome": result.label() })),
            Err(e) => {
                warn!(account_id = account.id, error = %e, "forced refresh failed");
                outcomes.push(json!({ "id": account.id, "outcome": "error" }));
            }
        }
    }
    envelope_ok(json!({ "refreshed": outcomes }))
}

async fn statistics(State(state): State<AdminState>) -> impl IntoResponse {
    match state.store.list_statistics().await {
        Ok(stats) => envelope_ok(json!(stats)),
        Err(e) => store_failure(e),
    }
}

async fn health_snapshots(State(state): State<AdminState>) -> impl IntoResponse {
    match state.store.list_health().await {
        Ok(snapshots) => envelope_ok(json!({ "snapshots": snapshots })),
        Err(e) => store_failure(e),
    }
}

async fn readiness_report(State(state): State<AdminState>) -> impl IntoResponse {
    match readiness(&state.store, state.h_fail_threshold).await {
        Ok(report) => envelope_ok(json!(report)),
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    account_id: Option<i64>,
    actor: Option<String>,
    before_id: Option<i64>,
    limit: Option<u32>,
}

async fn audit_events(
    State(state): State<AdminState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let actor = match query.actor.as_deref() {
        Some(raw) => match AuditActor::parse(raw) {
            Some(actor) => Some(actor),
            None => return envelope_err(StatusCode::BAD_REQUEST, "unknown actor"),
        },
        None => None,
    };
    let filter = AuditFilter {
        account_id: query.account_id,
        actor,
        before_id: query.before_id,
    };
    let limit = query.limit.unwrap_or(50).min(MAX_EVENT_PAGE);

    match state.store.list_audit(&filter, limit).await {
        Ok(events) => envelope_ok(json!({ "events": events })),
        Err(e) => store_failure(e),
    }
}
