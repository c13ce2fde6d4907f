//! Error types for identity-provider operations

/// Classified refresh failure; drives the pool state machine.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The provider refused the refresh token (revoked / invalid grant).
    #[error("refresh token rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The provider reports the account out of requests.
    #[error("quota exhausted: {detail}")]
    QuotaExhausted { detail: String },

    /// Retryable provider-side failure (5xx, odd 4xx, malformed body).
    #[error("transient refresh failure ({status}): {detail}")]
    Transient { status: u16, detail: String },

    /// The provider was never reached.
    #[error("network error: {0}")]
    Network(String),
}

/// Errors from non-refresh operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
