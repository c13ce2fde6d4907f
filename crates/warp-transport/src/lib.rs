//! Upstream streaming transport
//!
//! Issues one streaming request to the Warp API per dispatch attempt and
//! turns the response body into a lazy [`warp_codec::EventStream`]. The
//! transport knows nothing about accounts or retries: it is handed an
//! access token and opaque request bytes and reports exactly one attempt.

pub mod client;
pub mod error;

pub use client::{TransportConfig, WarpTransport};
pub use error::{NetworkErrorKind, TransportError};
