//! Warp identity-provider client
//!
//! Exchanges long-lived refresh tokens for short-lived access tokens and
//! reads the account's request-quota standing. Every outcome is
//! classified so the pool can drive its state machine from the result
//! without inspecting HTTP details:
//!
//! - `ok` — fresh access token (and, when readable, a quota snapshot)
//! - `refresh_rejected` — the provider revoked or refused the refresh
//!   token; the account is done until an operator intervenes
//! - `quota_exhausted` — the provider says no requests remain
//! - `refresh_transient` — a retryable provider-side failure
//! - `network` — the provider was never reached

pub mod constants;
pub mod error;
pub mod refresh;

pub use constants::{DEFAULT_QUOTA_URL, DEFAULT_TOKEN_URL};
pub use error::{Error, RefreshError, Result};
pub use refresh::{AuthRefresher, Quota, RefreshGrant};
