//! Warp event codec
//!
//! Narrow decoding interface between the upstream wire format and the rest
//! of the gateway. The upstream speaks server-sent events; each frame's
//! data payload is an envelope that decodes into one typed [`WarpEvent`].
//! Everything past this boundary works in typed events only; no other
//! crate parses upstream frames.
//!
//! The decoder is incremental: frames may arrive split across arbitrary
//! chunk boundaries and are emitted only once complete.

pub mod event;
pub mod sse;

pub use event::{EventStream, WarpEvent, decode_event};
pub use sse::{SseDecoder, SseFrame};

/// Errors from frame decoding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed event payload: {0}")]
    Malformed(String),

    #[error("unknown event kind: {0}")]
    UnknownKind(String),
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;
