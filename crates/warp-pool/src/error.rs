//! Error types for pool operations

/// Aggregate outcome of a failed dispatch, after every attempt was
/// absorbed into account state transitions.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No eligible account, or the attempt budget ran out across mixed
    /// failure kinds.
    #[error("no ready account")]
    Unavailable,

    /// Every tried account failed to produce an access token.
    #[error("all accounts failed refresh")]
    AuthFailed,

    /// Every tried account received a terminal 4xx from the upstream.
    #[error("upstream rejected all accounts")]
    UpstreamRejected,

    /// Every tried account hit a network failure or 5xx.
    #[error("upstream unreachable")]
    UpstreamUnreachable,

    /// Store-layer failure; fatal to the current dispatch.
    #[error("store error: {0}")]
    Store(#[from] warp_store::Error),
}
