//! Refresh-token exchange and quota lookup
//!
//! One HTTPS POST per refresh. The identity provider speaks the standard
//! `grant_type=refresh_token` form dialect; the response carries the new
//! access token either as `access_token` or (Firebase-style) `id_token`,
//! and `expires_in` arrives as a number or a numeric string depending on
//! the backend revision.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::RefreshError;

/// Markers the provider uses for a revoked or invalid refresh token.
const REJECTION_MARKERS: &[&str] = &["invalid_grant", "revoked", "token_expired", "user_disabled"];

/// Markers for an account with no requests remaining.
const QUOTA_MARKERS: &[&str] = &["no remaining quota", "no ai requests remaining"];

/// Maximum response-body bytes kept for classification and logging.
const BODY_SNIPPET_LEN: usize = 2048;

/// Outcome of a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// The provider may rotate the refresh token; when present the caller
    /// re-seals and persists it.
    pub refresh_token: Option<String>,
    pub quota: Option<Quota>,
}

/// Request-limit standing reported by the quota endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Quota {
    pub limit: i64,
    pub used: i64,
    #[serde(default)]
    pub next_refresh_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_seconds: Option<i64>,
    #[serde(default)]
    pub is_unlimited: bool,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    /// Firebase-style alias for the access token.
    #[serde(default)]
    id_token: Option<String>,
    #[serde(deserialize_with = "number_or_string")]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Accept `3600` and `"3600"`; the provider has shipped both.
fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Identity-provider client. One instance is shared by the dispatch
/// pipeline, the health monitor, and the admin force-refresh routes.
pub struct AuthRefresher {
    client: reqwest::Client,
    token_url: String,
    quota_url: String,
    timeout: Duration,
}

impl AuthRefresher {
    pub fn new(
        client: reqwest::Client,
        token_url: String,
        quota_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            token_url,
            quota_url,
            timeout,
        }
    }

    /// Exchange a refresh token for an access token and quota standing.
    ///
    /// The quota lookup is best-effort: a failed read logs and yields
    /// `quota: None` rather than failing a refresh that already produced
    /// a usable access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, RefreshError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = snippet(
                &response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>")),
            );
            return Err(classify_refresh_failure(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::Transient {
                status,
                detail: format!("invalid token response: {e}"),
            })?;

        let access_token = token
            .access_token
            .or(token.id_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::Transient {
                status,
                detail: "token response without access token".into(),
            })?;
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in as i64);

        let quota = match self.fetch_quota(&access_token).await {
            Ok(q) => Some(q),
            Err(e) => {
                debug!(error = %e, "quota lookup failed, continuing without snapshot");
                None
            }
        };

        Ok(RefreshGrant {
            access_token,
            expires_at,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            quota,
        })
    }

    /// Read the quota standing for a freshly issued access token.
    async fn fetch_quota(&self, access_token: &str) -> Result<Quota, crate::Error> {
        let response = self
            .client
            .get(&self.quota_url)
            .bearer_auth(access_token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| crate::Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(crate::Error::Http(format!(
                "quota endpoint returned {status}"
            )));
        }
        response
            .json::<Quota>()
            .await
            .map_err(|e| crate::Error::InvalidResponse(e.to_string()))
    }
}

/// Classify a non-2xx token-endpoint response.
pub fn classify_refresh_failure(status: u16, body: &str) -> RefreshError {
    let lower = body.to_lowercase();

    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        return RefreshError::QuotaExhausted {
            detail: snippet(body),
        };
    }
    if (400..500).contains(&status) && REJECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        warn!(status, "refresh token rejected by identity provider");
        return RefreshError::Rejected {
            status,
            detail: snippet(body),
        };
    }
    RefreshError::Transient {
        status,
        detail: snippet(body),
    }
}

fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LEN {
        body.to_string()
    } else {
        let mut end = BODY_SNIPPET_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_accepts_access_token_field() {
        let json = r#"{"access_token":"at_1","expires_in":3600}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token.as_deref(), Some("at_1"));
        assert_eq!(parsed.expires_in, 3600);
    }

    #[test]
    fn token_response_accepts_id_token_alias() {
        let json = r#"{"id_token":"at_2","expires_in":"3600","refresh_token":"rt_new"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id_token.as_deref(), Some("at_2"));
        assert_eq!(parsed.expires_in, 3600);
        assert_eq!(parsed.refresh_token.as_deref(), Some("rt_new"));
    }

    #[test]
    fn expires_in_rejects_non_numeric_string() {
        let json = r#"{"access_token":"at","expires_in":"soon"}"#;
        assert!(serde_json::from_str::<TokenResponse>(json).is_err());
    }

    #[test]
    fn rejection_markers_classify_as_rejected() {
        for body in [
            r#"{"error":"invalid_grant"}"#,
            r#"{"error":{"message":"TOKEN_EXPIRED"}}"#,
            "refresh token has been revoked",
        ] {
            assert!(
                matches!(
                    classify_refresh_failure(400, body),
                    RefreshError::Rejected { .. }
                ),
                "body: {body}"
            );
        }
    }

    #[test]
    fn rejection_marker_on_5xx_is_transient() {
        // A 5xx mentioning invalid_grant is the provider malfunctioning,
        // not a verdict on the token.
        assert!(matches!(
            classify_refresh_failure(500, r#"{"error":"invalid_grant"}"#),
            RefreshError::Transient { .. }
        ));
    }

    #[test]
    fn quota_markers_classify_as_exhausted() {
        assert!(matches!(
            classify_refresh_failure(403, "No remaining quota for this billing cycle"),
            RefreshError::QuotaExhausted { .. }
        ));
        assert!(matches!(
            classify_refresh_failure(429, "no AI requests remaining"),
            RefreshError::QuotaExhausted { .. }
        ));
    }

    #[test]
    fn plain_4xx_and_5xx_are_transient() {
        assert!(matches!(
            classify_refresh_failure(500, "internal error"),
            RefreshError::Transient { status: 500, .. }
        ));
        assert!(matches!(
            classify_refresh_failure(400, "bad request"),
            RefreshError::Transient { status: 400, .. }
        ));
    }

    #[test]
    fn quota_parses_optional_fields() {
        let q: Quota =
            serde_json::from_str(r#"{"limit":100,"used":40,"is_unlimited":false}"#).unwrap();
        assert_eq!(q.limit, 100);
        assert_eq!(q.used, 40);
        assert!(q.next_refresh_at.is_none());
        assert!(!q.is_unlimited);

        let q: Quota = serde_json::from_str(
            r#"{"limit":0,"used":0,"is_unlimited":true,"refresh_seconds":18000}"#,
        )
        .unwrap();
        assert!(q.is_unlimited);
        assert_eq!(q.refresh_seconds, Some(18000));
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long = "é".repeat(BODY_SNIPPET_LEN);
        let cut = snippet(&long);
        assert!(cut.len() <= BODY_SNIPPET_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let refresher = AuthRefresher::new(
            reqwest::Client::new(),
            // Reserved TEST-NET-1 address: nothing listens there.
            "http://192.0.2.1:9/token".into(),
            "http://192.0.2.1:9/quota".into(),
            Duration::from_millis(200),
        );
        let err = refresher.refresh("rt_any").await.unwrap_err();
        assert!(matches!(err, RefreshError::Network(_)));
    }
}
