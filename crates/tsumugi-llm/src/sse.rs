//! Shared SSE (Server-Sent Events) line framing and event decoding.

use futures::{Stream, StreamExt};
use serde_json::Value;

use tsumugi_core::error::{BoxError, StreamError};

/// Marker that introduces an event payload line.
pub const DATA_PREFIX: &str = "data:";

/// A decoded `data:` payload: the event `type` plus the untouched JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Decode one SSE line.
///
/// Returns `Ok(None)` for lines that carry no event (blank keep-alives,
/// `event:` names, comments). A `data:` line whose remainder is not a JSON
/// object with a string `type` is an error.
pub fn decode_line(line: &str) -> Result<Option<RawEvent>, StreamError> {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let data = data.strip_prefix(' ').unwrap_or(data);

    let payload: Value =
        serde_json::from_str(data).map_err(|e| StreamError::Decode(e.to_string()))?;
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| StreamError::malformed("<untyped>", "missing string `type` field"))?
        .to_string();

    Ok(Some(RawEvent {
        event_type,
        payload,
    }))
}

fn finish_line(mut raw: Vec<u8>, max_line_bytes: usize) -> Result<String, StreamError> {
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    if raw.len() > max_line_bytes {
        return Err(StreamError::LineTooLong {
            limit: max_line_bytes,
        });
    }
    String::from_utf8(raw).map_err(|e| StreamError::Decode(e.to_string()))
}

/// Split a chunked response body into lines.
///
/// Bytes are buffered until a newline arrives, so chunk boundaries may fall
/// anywhere, including inside a multi-byte character. A transport error ends
/// the stream after being yielded once.
pub fn sse_lines<S, B, E>(
    body: S,
    max_line_bytes: usize,
) -> impl Stream<Item = Result<String, StreamError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<BoxError> + Send,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes before this offset are known not to contain a newline.
        let mut scanned = 0;
        let mut body = Box::pin(body);

        while let Some(result) = body.next().await {
            let chunk = match result {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(StreamError::Transport(e.into()));
                    return;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=scanned + offset).collect();
                scanned = 0;
                let line = finish_line(line, max_line_bytes);
                let failed = line.is_err();
                yield line;
                if failed {
                    return;
                }
            }
            scanned = buffer.len();

            // A trailing `\r` may be the first half of a `\r\n` still in flight.
            let pending = match buffer.last() {
                Some(b'\r') => buffer.len() - 1,
                _ => buffer.len(),
            };
            if pending > max_line_bytes {
                yield Err(StreamError::LineTooLong { limit: max_line_bytes });
                return;
            }
        }

        // Handle any remaining data in the buffer.
        if !buffer.is_empty() {
            yield finish_line(buffer, max_line_bytes);
        }
    }
}

/// Line stream over a `reqwest` response body.
pub fn response_lines(
    response: reqwest::Response,
    max_line_bytes: usize,
) -> impl Stream<Item = Result<String, StreamError>> + Send {
    sse_lines(response.bytes_stream(), max_line_bytes)
}
