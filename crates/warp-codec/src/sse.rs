//! Incremental server-sent-event framing
//!
//! Splits a byte stream into SSE frames without assuming chunk alignment.
//! A frame is complete at the first blank line; `data:` lines accumulate
//! (joined with `\n`), `event:` names the frame, comment lines (`:`) and
//! unknown fields are dropped. CRLF and LF line endings both occur in the
//! wild and are accepted.

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` payload.
    pub data: String,
}

/// Stateful frame splitter fed with raw body chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame completed by it.
    ///
    /// Bytes that are not valid UTF-8 are replaced; the upstream protocol
    /// is UTF-8 so this only triggers on a chunk split inside a multi-byte
    /// sequence, which the replacement at frame granularity tolerates for
    /// everything but the split character itself.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        loop {
            let Some((boundary, skip)) = find_frame_boundary(&self.buf) else {
                break;
            };
            let raw: String = self.buf.drain(..boundary + skip).collect();
            if let Some(frame) = parse_frame(&raw[..boundary]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drain any trailing partial frame at end of stream.
    ///
    /// Well-formed upstreams terminate every frame; this is a salvage path
    /// for connections cut mid-frame.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buf);
        parse_frame(&raw)
    }
}

/// Locate the first blank-line boundary. Returns (frame end, separator len).
fn find_frame_boundary(buf: &str) -> Option<(usize, usize)> {
    let lf = buf.find("\n\n").map(|i| (i, 2));
    let crlf = buf.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some((a, al)), Some((b, bl))) => {
            if b + 2 == a {
                // "\r\n\r\n" whose second "\r\n" begins the "\n\n" match
                Some((b, bl))
            } else if a < b {
                Some((a, al))
            } else {
                Some((b, bl))
            }
        }
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

/// Parse the lines of one frame. Returns None for comment-only frames.
fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}
