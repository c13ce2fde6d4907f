//! Identity-provider endpoints
//!
//! Production defaults; both are overridable through configuration so
//! tests and staging deployments can point at a local stand-in.

/// Token endpoint: exchanges `grant_type=refresh_token` for an access token.
pub const DEFAULT_TOKEN_URL: &str = "https://auth.app.warp.dev/v1/token";

/// Quota endpoint: reports the account's request-limit standing.
pub const DEFAULT_QUOTA_URL: &str = "https://app.warp.dev/api/request-limit";
