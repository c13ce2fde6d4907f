//! Warp Gateway
//!
//! Multi-protocol chat gateway over the Warp upstream:
//! 1. Accepts OpenAI / Anthropic / Gemini-dialect requests
//! 2. Funnels every request through the single-flight dispatch pipeline
//! 3. Rotates a pool of encrypted refresh-token accounts with failover
//! 4. Exposes an admin surface, readiness, and Prometheus metrics

mod adapter;
mod admin;
mod config;
mod error;
mod metrics;
mod upstream_impl;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warp_auth::AuthRefresher;
use warp_pool::{AccountLocks, Dispatcher, HealthMonitor, Refresher, Upstream};
use warp_store::{AccountStore, CryptoBox};
use warp_transport::WarpTransport;

use crate::adapter::{ProtocolKind, RenderContext, render_stream};
use crate::admin::{AdminAuth, AdminState};
use crate::config::Config;
use crate::upstream_impl::{PoolRefresher, PoolUpstream};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    store: Arc<AccountStore>,
    h_fail_threshold: i64,
    metrics_handle: PrometheusHandle,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting warp-gateway");

    let config = Config::from_env().context("failed to load configuration")?;
    let metrics_handle = metrics::install_recorder();

    let crypto = match &config.encryption_key {
        Some(key) => CryptoBox::from_base64url(key)
            .map_err(|e| anyhow!("TOKEN_ENCRYPTION_KEY invalid: {e}"))?,
        None => CryptoBox::derive_dev(),
    };
    let store = Arc::new(
        AccountStore::open(&config.db_path, crypto)
            .await
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );
    let locks = Arc::new(AccountLocks::new());

    let refresher: Arc<dyn Refresher> = Arc::new(PoolRefresher(AuthRefresher::new(
        reqwest::Client::new(),
        config.token_url.clone(),
        config.quota_url.clone(),
        config.refresh_timeout,
    )));
    let transport = WarpTransport::new(config.transport_config())
        .context("failed to build upstream client")?;
    let upstream: Arc<dyn Upstream> = Arc::new(PoolUpstream(transport));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&refresher),
        upstream,
        config.dispatch_config(),
    ));

    // The monitor starts after the store is open and stops before it
    // closes; the watch channel is the cooperative stop signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HealthMonitor::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&refresher),
        config.monitor_config(),
    );
    let monitor_handle = monitor.spawn(shutdown_rx);

    let admin_state = AdminState {
        store: Arc::clone(&store),
        locks: Arc::clone(&locks),
        refresher,
        auth: AdminAuth {
            mode: config.admin_auth_mode,
            token: config.admin_token.clone(),
        },
        h_fail_threshold: config.h_fail_threshold,
        cooldown_long: config.cooldown_long,
    };

    let app_state = AppState {
        dispatcher,
        store: Arc::clone(&store),
        h_fail_threshold: config.h_fail_threshold,
        metrics_handle,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_exposition))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .with_state(app_state)
        .merge(admin::admin_router(admin_state));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    shutdown_tx.send(true).ok();
    monitor_handle.await.ok();
    store.close().await;

    info!("shutdown complete");
    Ok(())
}

// ── client-facing handlers ─────────────────────────────────────────────

async fn openai_chat(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    chat(state, ProtocolKind::OpenAi, body, None).await
}

async fn anthropic_messages(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    chat(state, ProtocolKind::Anthropic, body, None).await
}

/// Gemini puts the model in the path: `{model}:streamGenerateContent`.
async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let model = model_action
        .split(':')
        .next()
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    chat(state, ProtocolKind::Gemini, body, model.as_deref()).await
}

async fn chat(
    state: AppState,
    kind: ProtocolKind,
    body: Value,
    model_hint: Option<&str>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    let normalized = match kind.normalize_request(&body, model_hint) {
        Ok(normalized) => normalized,
        Err(e) => return error::invalid_request(&e.to_string()).into_response(),
    };

    match state
        .dispatcher
        .dispatch(normalized.bytes, &normalized.model)
        .await
    {
        Ok(events) => {
            let ctx = RenderContext {
                request_id,
                model: normalized.model,
            };
            let frames = render_stream(kind, events, ctx);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(frames))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            let readiness = warp_pool::readiness(&state.store, state.h_fail_threshold)
                .await
                .ok();
            error::dispatch_error_response(&err, readiness.as_ref()).into_response()
        }
    }
}

// ── operational handlers ───────────────────────────────────────────────

/// Liveness + pool summary.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let pool = warp_pool::readiness(&state.store, state.h_fail_threshold)
        .await
        .ok();
    let status = match &pool {
        Some(report) if report.ready => "ok",
        Some(_) => "degraded",
        None => "unhealthy",
    };
    axum::Json(json!({
        "status": status,
        "uptime_seconds": uptime,
        "pool": pool,
    }))
}

/// Prometheus text exposition.
async fn metrics_exposition(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
