//! Typed upstream events

use std::pin::Pin;

use futures_util::Stream;
use serde::Deserialize;

use crate::{Error, Result, sse::SseFrame};

/// A lazy, finite, non-restartable sequence of upstream events.
///
/// Produced once per upstream send. `End` and `Error` are terminal; no
/// further items follow either.
pub type EventStream = Pin<Box<dyn Stream<Item = WarpEvent> + Send>>;

/// One decoded upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum WarpEvent {
    /// Incremental model output text.
    Text { content: String },
    /// A tool invocation requested by the model.
    ToolCall {
        name: String,
        arguments: serde_json::Value,
        call_id: Option<String>,
    },
    /// Stream metadata (model name, usage, conversation identifiers).
    Meta { detail: serde_json::Value },
    /// Normal end of stream.
    End { reason: String },
    /// Terminal error frame. Mid-stream network failures are surfaced as
    /// this variant by the transport.
    Error { code: String, message: String },
}

impl WarpEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WarpEvent::End { .. } | WarpEvent::Error { .. })
    }
}

/// Wire envelope for one event payload.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode one SSE frame into a typed event.
///
/// The upstream marks stream completion with a bare `[DONE]` sentinel in
/// addition to the `end` envelope; both decode to [`WarpEvent::End`].
pub fn decode_event(frame: &SseFrame) -> Result<WarpEvent> {
    let data = frame.data.trim();
    if data == "[DONE]" {
        return Ok(WarpEvent::End {
            reason: "done".into(),
        });
    }

    let envelope: Envelope =
        serde_json::from_str(data).map_err(|e| Error::Malformed(e.to_string()))?;

    match envelope.kind.as_str() {
        "text" => Ok(WarpEvent::Text {
            content: envelope.content.unwrap_or_default(),
        }),
        "tool_call" => Ok(WarpEvent::ToolCall {
            name: envelope
                .name
                .ok_or_else(|| Error::Malformed("tool_call without name".into()))?,
            arguments: envelope.arguments.unwrap_or(serde_json::Value::Null),
            call_id: envelope.call_id,
        }),
        "meta" => Ok(WarpEvent::Meta {
            detail: envelope.detail.unwrap_or(serde_json::Value::Null),
        }),
        "end" => Ok(WarpEvent::End {
            reason: envelope.reason.unwrap_or_else(|| "stop".into()),
        }),
        "error" => Ok(WarpEvent::Error {
            code: envelope.code.unwrap_or_else(|| "upstream_error".into()),
            message: envelope.message.unwrap_or_default(),
        }),
        other => Err(Error::UnknownKind(other.to_string())),
    }
}
