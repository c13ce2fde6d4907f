//! Caller-facing error mapping
//!
//! The dispatch taxonomy maps onto stable HTTP statuses: `unavailable`
//! and `upstream_unreachable` are 503 (retry later), `auth_failed` and
//! `upstream_rejected` are 502 (the gateway reached upstream and was
//! turned away), adapter-detected bad requests are 400, bugs are 500.

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

use warp_pool::{DispatchError, Readiness};

/// Render a failed dispatch for the client, with back-off hints when the
/// pool state explains the failure.
pub fn dispatch_error_response(
    err: &DispatchError,
    readiness: Option<&Readiness>,
) -> (StatusCode, Json<Value>) {
    match err {
        DispatchError::Unavailable => {
            let mut body = json!({ "error": "no_ready_account", "ready": false });
            if let Some(r) = readiness {
                body["available"] = json!(r.available);
                if let Some(at) = r.next_recovery_at {
                    body["next_recovery_at"] = json!(at);
                }
            }
            (StatusCode::SERVICE_UNAVAILABLE, Json(body))
        }
        DispatchError::AuthFailed => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "auth_failed" })),
        ),
        DispatchError::UpstreamRejected => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "upstream_rejected" })),
        ),
        DispatchError::UpstreamUnreachable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "upstream_unreachable" })),
        ),
        DispatchError::Store(e) => {
            tracing::error!(error = %e, "store failure during dispatch");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal" })),
            )
        }
    }
}

/// Adapter-detected invalid request.
pub fn invalid_request(detail: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "request_invalid", "detail": detail })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(
            dispatch_error_response(&DispatchError::Unavailable, None).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            dispatch_error_response(&DispatchError::AuthFailed, None).0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            dispatch_error_response(&DispatchError::UpstreamRejected, None).0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            dispatch_error_response(&DispatchError::UpstreamUnreachable, None).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(invalid_request("x").0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unavailable_carries_recovery_hint() {
        let readiness = Readiness {
            total: 2,
            available: 0,
            cooldown: 2,
            blocked: 0,
            quota_exhausted: 0,
            disabled: 0,
            ready: false,
            next_recovery_at: Some(chrono::Utc::now() + chrono::Duration::seconds(60)),
        };
        let (_, Json(body)) =
            dispatch_error_response(&DispatchError::Unavailable, Some(&readiness));
        assert_eq!(body["error"], "no_ready_account");
        assert_eq!(body["available"], 0);
        assert!(body.get("next_recovery_at").is_some());
    }
}
