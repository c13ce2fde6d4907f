//! Failure classification
//!
//! Pure mapping from transport outcomes (HTTP status, retry hints, body
//! markers, network error kinds) to the typed outcome that drives state
//! transitions. Deterministic and side-effect free; the dispatch pipeline
//! owns what happens next.
//!
//! The upstream emits no typed error field, so quota and token-expiry
//! signals are matched as body substrings. Anything unrecognized lands in
//! `Unknown`, which never demotes an account beyond an error-count bump.

use warp_transport::{NetworkErrorKind, TransportError};

/// Quota exhaustion markers in upstream response bodies.
const QUOTA_MARKERS: &[&str] = &["no remaining quota", "no ai requests remaining"];

/// Token-expiry markers distinguishing an expired JWT from a WAF block.
const EXPIRY_MARKERS: &[&str] = &["expired", "invalid jwt", "exp claim"];

/// Classified outcome of one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The stream yielded at least one non-error event.
    Ok,
    /// 401/403 carrying a JWT-expiry signal; refresh and retry once.
    AuthExpired,
    /// 403 without an expiry signal (WAF or policy block).
    ForbiddenWaf,
    /// 429; cooldown derived from `Retry-After` when present.
    RateLimited { retry_after: Option<u64> },
    /// The account is out of requests.
    QuotaExhausted,
    /// The upstream was never (fully) reached.
    Network,
    /// 5xx.
    ServerError,
    /// Everything else. Kept safe: error-count bump only.
    Unknown,
}

impl Outcome {
    /// Stable label for audit events and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::AuthExpired => "auth_expired",
            Outcome::ForbiddenWaf => "forbidden_waf",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::QuotaExhausted => "quota_exhausted",
            Outcome::Network => "network",
            Outcome::ServerError => "server_error",
            Outcome::Unknown => "unknown",
        }
    }
}

/// Classify a send attempt that failed before yielding any event.
pub fn classify_send_failure(err: &TransportError) -> Outcome {
    match err {
        TransportError::Network { kind, .. } => classify_network(*kind),
        TransportError::Status {
            status,
            retry_after,
            body,
        } => classify_status(*status, *retry_after, body),
    }
}

/// Classify an HTTP status + body snippet.
pub fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> Outcome {
    let lower = body.to_lowercase();
    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        return Outcome::QuotaExhausted;
    }
    match status {
        429 => Outcome::RateLimited { retry_after },
        401 | 403 if EXPIRY_MARKERS.iter().any(|m| lower.contains(m)) => Outcome::AuthExpired,
        403 => Outcome::ForbiddenWaf,
        500..=599 => Outcome::ServerError,
        _ => Outcome::Unknown,
    }
}

fn classify_network(kind: NetworkErrorKind) -> Outcome {
    match kind {
        NetworkErrorKind::Connect
        | NetworkErrorKind::Timeout
        | NetworkErrorKind::Reset
        | NetworkErrorKind::Other => Outcome::Network,
    }
}

/// Classify an error event delivered inside the stream (first-event or
/// mid-stream).
pub fn classify_error_event(code: &str, message: &str) -> Outcome {
    let lower = format!("{code} {message}").to_lowercase();
    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) || code == "quota" {
        return Outcome::QuotaExhausted;
    }
    if code == "network" {
        return Outcome::Network;
    }
    if lower.contains("rate limit") {
        return Outcome::RateLimited { retry_after: None };
    }
    Outcome::Unknown
}
