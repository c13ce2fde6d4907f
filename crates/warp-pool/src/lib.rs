//! Account pool and dispatch pipeline
//!
//! The heart of the gateway: selects an eligible account under a
//! deterministic ordering, holds its exclusivity lock for the duration of
//! one upstream send, refreshes access tokens on demand, classifies every
//! failure, and drives the account state machine through the store. All
//! upstream traffic flows through [`dispatch::Dispatcher`]; protocol
//! adapters never talk to the transport directly.
//!
//! Account lifecycle:
//! 1. Admin imports a refresh token → row `active`
//! 2. Dispatch selects the account, refreshing its access token if stale
//! 3. Rate limits and repeated failures park it in `cooldown`
//! 4. A quota signal parks it in `quota_exhausted` for the long cooldown
//! 5. A rejected refresh token marks it `blocked` until an operator acts
//! 6. The health monitor probes in the background and demotes or restores
//!
//! The [`Refresher`] and [`Upstream`] traits are the seams to the identity
//! provider and the streaming transport; the service binary provides the
//! production implementations, tests substitute scripted ones.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use warp_auth::{RefreshError, RefreshGrant};
use warp_codec::EventStream;
use warp_transport::TransportError;

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod locks;
pub mod readiness;
pub mod refresh;
pub mod select;

pub use classify::Outcome;
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::DispatchError;
pub use health::{HealthMonitor, MonitorConfig};
pub use locks::AccountLocks;
pub use readiness::{Readiness, readiness};
pub use refresh::{RefreshResult, refresh_account};
pub use select::{SelectorConfig, select_account};

/// Exchanges a refresh token for an access token + quota standing.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Refresher>`).
pub trait Refresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<RefreshGrant, RefreshError>> + Send + 'a>>;
}

/// Issues one streaming upstream request bearing an access token.
pub trait Upstream: Send + Sync {
    fn send<'a>(
        &'a self,
        access_token: &'a str,
        request: Bytes,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<EventStream, TransportError>> + Send + 'a>>;
}
