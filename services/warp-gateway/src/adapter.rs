//! Protocol adapters
//!
//! Three wire dialects, one capability set: normalize the inbound request
//! into opaque Warp bytes, render each upstream event as a protocol
//! frame, and emit the protocol's tail on completion. The mapping is
//! deliberately mechanical; adapters never talk to the transport, only
//! to the dispatcher.

use bytes::Bytes;
use serde_json::{Value, json};

use warp_codec::WarpEvent;

/// Which protocol dialect a route speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    OpenAi,
    Anthropic,
    Gemini,
}

/// Per-request rendering context.
pub struct RenderContext {
    pub request_id: String,
    pub model: String,
}

/// Normalized request ready for dispatch.
pub struct NormalizedRequest {
    pub bytes: Bytes,
    pub model: String,
}

/// Adapter-detected request problems.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("missing or non-string model field")]
    MissingModel,

    #[error("request body must be a JSON object")]
    NotAnObject,
}

impl ProtocolKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolKind::OpenAi => "openai",
            ProtocolKind::Anthropic => "anthropic",
            ProtocolKind::Gemini => "gemini",
        }
    }

    /// Wrap the protocol payload in the upstream envelope.
    ///
    /// `model_hint` carries the path-derived model for dialects (Gemini)
    /// that put it in the URL instead of the body.
    pub fn normalize_request(
        &self,
        body: &Value,
        model_hint: Option<&str>,
    ) -> Result<NormalizedRequest, AdapterError> {
        if !body.is_object() {
            return Err(AdapterError::NotAnObject);
        }
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .or(model_hint)
            .ok_or(AdapterError::MissingModel)?
            .to_string();

        let envelope = json!({
            "model": model,
            "dialect": self.label(),
            "stream": true,
            "payload": body,
        });
        Ok(NormalizedRequest {
            bytes: Bytes::from(envelope.to_string()),
            model,
        })
    }

    /// Render one upstream event as an SSE frame for this dialect.
    ///
    /// `None` means the event has no representation (metadata the dialect
    /// carries elsewhere).
    pub fn render_event(&self, event: &WarpEvent, ctx: &RenderContext) -> Option<String> {
        match (self, event) {
            (_, WarpEvent::Meta { .. }) => None,

            (ProtocolKind::OpenAi, WarpEvent::Text { content }) => Some(sse_data(&json!({
                "id": ctx.request_id,
                "object": "chat.completion.chunk",
                "model": ctx.model,
                "choices": [{ "index": 0, "delta": { "content": content } }],
            }))),
            (ProtocolKind::OpenAi, WarpEvent::ToolCall {
                name,
                arguments,
                call_id,
            }) => Some(sse_data(&json!({
                "id": ctx.request_id,
                "object": "chat.completion.chunk",
                "model": ctx.model,
                "choices": [{
                    "index": 0,
                    "delta": { "tool_calls": [{
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments.to_string() },
                    }]},
                }],
            }))),
            (ProtocolKind::OpenAi, WarpEvent::End { .. }) => None, // finalize() owns the tail
            (ProtocolKind::OpenAi, WarpEvent::Error { code, message }) => Some(sse_data(&json!({
                "error": { "type": code, "message": message },
            }))),

            (ProtocolKind::Anthropic, WarpEvent::Text { content }) => Some(sse_event(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": content },
                }),
            )),
            (ProtocolKind::Anthropic, WarpEvent::ToolCall {
                name,
                arguments,
                call_id,
            }) => Some(sse_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {
                        "type": "tool_use",
                        "id": call_id,
                        "name": name,
                        "input": arguments,
                    },
                }),
            )),
            (ProtocolKind::Anthropic, WarpEvent::End { .. }) => None,
            (ProtocolKind::Anthropic, WarpEvent::Error { code, message }) => Some(sse_event(
                "error",
                &json!({ "type": "error", "error": { "type": code, "message": message } }),
            )),

            (ProtocolKind::Gemini, WarpEvent::Text { content }) => Some(sse_data(&json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": content }] },
                }],
            }))),
            (ProtocolKind::Gemini, WarpEvent::ToolCall { name, arguments, .. }) => {
                Some(sse_data(&json!({
                    "candidates": [{
                        "content": { "role": "model", "parts": [{
                            "functionCall": { "name": name, "args": arguments },
                        }]},
                    }],
                })))
            }
            (ProtocolKind::Gemini, WarpEvent::End { .. }) => None,
            (ProtocolKind::Gemini, WarpEvent::Error { code, message }) => Some(sse_data(&json!({
                "error": { "status": code, "message": message },
            }))),
        }
    }

    /// Protocol tail emitted after the upstream stream ends.
    pub fn finalize(&self, reason: &str, ctx: &RenderContext) -> Option<String> {
        match self {
            ProtocolKind::OpenAi => {
                let tail = sse_data(&json!({
                    "id": ctx.request_id,
                    "object": "chat.completion.chunk",
                    "model": ctx.model,
                    "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }],
                }));
                Some(format!("{tail}data: [DONE]\n\n"))
            }
            ProtocolKind::Anthropic => Some(sse_event(
                "message_stop",
                &json!({ "type": "message_stop" }),
            )),
            ProtocolKind::Gemini => Some(sse_data(&json!({
                "candidates": [{ "finishReason": reason.to_uppercase(), "content": { "parts": [] } }],
            }))),
        }
    }
}

fn sse_data(value: &Value) -> String {
    format!("data: {value}\n\n")
}

fn sse_event(event: &str, value: &Value) -> String {
    format!("event: {event}\ndata: {value}\n\n")
}

/// Render a dispatched event stream as protocol SSE frames.
///
/// The tail is emitted exactly once: after the upstream `End` event, or
/// after a stream that ran dry without one. A terminal error frame gets
/// no tail, so clients cannot read a completed response out of a failure.
pub fn render_stream(
    kind: ProtocolKind,
    events: warp_codec::EventStream,
    ctx: RenderContext,
) -> impl futures_util::Stream<Item = Result<Bytes, std::convert::Infallible>> {
    use futures_util::StreamExt;

    struct RenderState {
        kind: ProtocolKind,
        events: warp_codec::EventStream,
        ctx: RenderContext,
        finished: bool,
    }

    let state = RenderState {
        kind,
        events,
        ctx,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            match st.events.next().await {
                Some(event) => {
                    let mut out = String::new();
                    if let Some(frame) = st.kind.render_event(&event, &st.ctx) {
                        out.push_str(&frame);
                    }
                    match &event {
                        WarpEvent::End { reason } => {
                            st.finished = true;
                            if let Some(tail) = st.kind.finalize(reason, &st.ctx) {
                                out.push_str(&tail);
                            }
                        }
                        WarpEvent::Error { .. } => st.finished = true,
                        _ => {}
                    }
                    if out.is_empty() {
                        continue;
                    }
                    return Some((Ok(Bytes::from(out)), st));
                }
                None => {
                    st.finished = true;
                    if let Some(tail) = st.kind.finalize("stop", &st.ctx) {
                        return Some((Ok(Bytes::from(tail)), st));
                    }
                    return None;
                }
            }
        }
    })
}
