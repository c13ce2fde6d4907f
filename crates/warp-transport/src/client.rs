//! Streaming upstream client
//!
//! One `send` = one HTTPS request = one event stream. The HTTP status and
//! headers resolve before the stream is returned, so status-level failures
//! surface as [`TransportError`] and never as a half-built stream. Frames
//! are decoded incrementally; dropping the returned stream drops the
//! response body and frees the connection within one read timeout.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use tracing::{debug, warn};

use warp_codec::{EventStream, SseDecoder, WarpEvent, decode_event};

use crate::error::TransportError;

/// Maximum error-body bytes retained for classification.
const ERROR_BODY_LIMIT: usize = 2048;

/// Transport tuning; all fields map 1:1 to configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub api_url: String,
    pub connect_timeout: Duration,
    pub read_idle_timeout: Duration,
    /// Speak HTTP/2 without ALPN negotiation (cleartext or pinned h2).
    pub http2_prior_knowledge: bool,
}

/// The single client behind every upstream send.
pub struct WarpTransport {
    client: reqwest::Client,
    api_url: String,
}

impl WarpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_idle_timeout);
        if config.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }
        Ok(Self {
            client: builder.build()?,
            api_url: config.api_url,
        })
    }

    /// Issue one streaming request bearing `access_token`.
    ///
    /// Returns the decoded event stream on a 2xx response. The stream is
    /// finite and non-restartable; a mid-stream network failure is
    /// delivered as a terminal [`WarpEvent::Error`].
    pub async fn send(
        &self,
        access_token: &str,
        request: Bytes,
    ) -> Result<EventStream, TransportError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(request)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = read_limited_body(response).await;
            debug!(status = status.as_u16(), "upstream rejected send");
            return Err(TransportError::Status {
                status: status.as_u16(),
                retry_after,
                body,
            });
        }

        Ok(decode_body(response.bytes_stream().boxed()))
    }
}

/// Parse a `Retry-After` header in seconds form.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn read_limited_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(ERROR_BODY_LIMIT);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        Err(_) => String::from("<unreadable body>"),
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct DecodeState {
    body: BodyStream,
    decoder: SseDecoder,
    pending: VecDeque<WarpEvent>,
    done: bool,
}

/// Turn a raw body stream into a typed event stream.
///
/// Undecodable frames are dropped with a warning: the stream stays alive
/// for whatever well-formed frames follow. The first `End` or `Error`
/// event is terminal; the body is not polled past it.
fn decode_body(body: BodyStream) -> EventStream {
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if event.is_terminal() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((event, st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    for frame in st.decoder.feed(&chunk) {
                        match decode_event(&frame) {
                            Ok(event) => st.pending.push_back(event),
                            Err(e) => warn!(error = %e, "dropping undecodable upstream frame"),
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((
                        WarpEvent::Error {
                            code: "network".into(),
                            message: e.to_string(),
                        },
                        st,
                    ));
                }
                None => {
                    st.done = true;
                    // Salvage a final frame cut off without its blank line.
                    if let Some(frame) = st.decoder.finish()
                        && let Ok(event) = decode_event(&frame)
                    {
                        return Some((event, st));
                    }
                    return None;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_from(chunks: Vec<Result<Bytes, reqwest::Error>>) -> BodyStream {
        stream::iter(chunks).boxed()
    }

    async fn collect(stream: EventStream) -> Vec<WarpEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn decodes_chunked_frames_into_events() {
        let body = body_from(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"text\",\"content\":\"he")),
            Ok(Bytes::from_static(b"llo\"}\n\ndata: {\"type\":\"end\"}\n\n")),
        ]);
        let events = collect(decode_body(body)).await;
        assert_eq!(
            events,
            vec![
                WarpEvent::Text {
                    content: "hello".into()
                },
                WarpEvent::End {
                    reason: "stop".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn stream_stops_at_terminal_event() {
        let body = body_from(vec![Ok(Bytes::from_static(
            b"data: {\"type\":\"end\"}\n\ndata: {\"type\":\"text\",\"content\":\"late\"}\n\n",
        ))]);
        let events = collect(decode_body(body)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WarpEvent::End { .. }));
    }

    #[tokio::test]
    async fn undecodable_frames_are_skipped() {
        let body = body_from(vec![Ok(Bytes::from_static(
            b"data: garbage\n\ndata: {\"type\":\"text\",\"content\":\"ok\"}\n\n",
        ))]);
        let events = collect(decode_body(body)).await;
        assert_eq!(
            events,
            vec![WarpEvent::Text {
                content: "ok".into()
            }]
        );
    }

    #[tokio::test]
    async fn truncated_final_frame_is_salvaged() {
        let body = body_from(vec![Ok(Bytes::from_static(
            b"data: {\"type\":\"text\",\"content\":\"tail\"}",
        ))]);
        let events = collect(decode_body(body)).await;
        assert_eq!(
            events,
            vec![WarpEvent::Text {
                content: "tail".into()
            }]
        );
    }

    #[tokio::test]
    async fn empty_body_yields_no_events() {
        let events = collect(decode_body(body_from(vec![]))).await;
        assert!(events.is_empty());
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("30"),
        );
        assert_eq!(parse_retry_after(&headers), Some(30));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        // HTTP-date form is ignored rather than misread.
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_network_error() {
        let transport = WarpTransport::new(TransportConfig {
            api_url: "http://192.0.2.1:9/agent".into(),
            connect_timeout: Duration::from_millis(200),
            read_idle_timeout: Duration::from_secs(1),
            http2_prior_knowledge: false,
        })
        .unwrap();
        let err = transport
            .send("at_test", Bytes::from_static(b"{}"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Network { .. }));
    }
}
