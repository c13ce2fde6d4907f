//! Transport error types

/// Coarse network failure kinds, preserved for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// TCP/TLS connect failure (includes DNS).
    Connect,
    /// Request or read deadline exceeded.
    Timeout,
    /// Connection dropped mid-exchange.
    Reset,
    Other,
}

impl NetworkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Reset => "reset",
            NetworkErrorKind::Other => "other",
        }
    }
}

/// A failed upstream attempt, observed before any event was yielded.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Non-success HTTP status; body snippet kept for classification.
    #[error("upstream returned {status}")]
    Status {
        status: u16,
        /// Parsed `Retry-After` header, seconds.
        retry_after: Option<u64>,
        body: String,
    },

    /// The upstream was never reached or dropped the connection before
    /// the response line.
    #[error("network error ({}): {detail}", kind.as_str())]
    Network {
        kind: NetworkErrorKind,
        detail: String,
    },
}

impl TransportError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            NetworkErrorKind::Reset
        } else {
            NetworkErrorKind::Other
        };
        TransportError::Network {
            kind,
            detail: err.to_string(),
        }
    }
}
