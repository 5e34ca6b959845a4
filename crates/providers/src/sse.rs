//! Shared SSE streaming infrastructure for all provider adapters.
//!
//! Every provider follows the same pattern: receive a `reqwest::Response`,
//! buffer chunks, split on frame delimiters, extract `event:`/`data:`
//! lines, and feed each frame to a provider-specific parser that returns
//! `Vec<Result<AssistantMessageEvent>>`.
//!
//! This module extracts that shared logic into two pieces:
//! - [`drain_frames`] -- pull complete frames from an SSE buffer
//! - [`sse_response_stream`] -- build a `BoxStream` from a response + parser

use helm_domain::error::Result;
use helm_domain::stream::BoxStream;

use crate::http::from_reqwest;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` name, when the frame carried one.
    pub event: Option<String>,
    /// All `data:` payloads in the frame, joined by `\n` and trimmed.
    pub data: String,
}

/// Extract complete frames from an SSE buffer.
///
/// Frames are delimited by `\n\n` or `\r\n\r\n`; `\r\n` is normalized to
/// `\n` within each frame before line parsing. Frames whose data is
/// empty or the `[DONE]` sentinel are suppressed.
///
/// The buffer is drained in-place: consumed bytes are removed and any
/// trailing partial frame remains for the next call.
pub fn drain_frames(buffer: &mut String) -> Vec<SseFrame> {
    let mut frames = Vec::new();

    loop {
        let lf = buffer.find("\n\n");
        let crlf = buffer.find("\r\n\r\n");
        let (pos, delim_len) = match (lf, crlf) {
            (Some(l), Some(c)) if c < l => (c, 4),
            (Some(l), _) => (l, 2),
            (None, Some(c)) => (c, 4),
            (None, None) => break,
        };

        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..delim_len);
        let block = block.replace("\r\n", "\n");

        let mut event: Option<String> = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim());
            }
        }

        let data = data_lines.join("\n").trim().to_string();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        frames.push(SseFrame { event, data });
    }

    frames
}

/// Build a [`BoxStream`] from an SSE `reqwest::Response` and a
/// provider-specific parser closure.
///
/// The closure receives `Some(frame)` for each complete frame and a
/// final `None` once the response body closes, letting it flush a
/// trailing aggregate event. It is `FnMut` because every adapter keeps
/// mutable assembly state across frames.
///
/// Trailing unterminated bytes are dropped when the body closes: the
/// usual cause is cancellation mid-frame, and a partial frame would
/// corrupt incremental tool-call reconstruction. Dropping the returned
/// stream cancels the underlying request.
pub(crate) fn sse_response_stream<T, F>(
    response: reqwest::Response,
    mut parse_frame: F,
) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnMut(Option<SseFrame>) -> Vec<Result<T>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    for frame in drain_frames(&mut buffer) {
                        for event in parse_frame(Some(frame)) {
                            let failed = event.is_err();
                            yield event;
                            if failed {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => {
                    if !buffer.trim().is_empty() {
                        tracing::debug!(
                            bytes = buffer.len(),
                            "dropping unterminated trailing SSE frame"
                        );
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            }
        }

        for event in parse_frame(None) {
            yield event;
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_frame() {
        let mut buf = String::from("event: message\ndata: {\"hello\":\"world\"}\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "{\"hello\":\"world\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_multiple_frames() {
        let mut buf = String::from("data: first\n\ndata: second\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "first");
        assert_eq!(frames[1].data, "second");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_crlf_delimiters() {
        let mut buf = String::from("event: ping\r\ndata: one\r\n\r\ndata: two\r\n\r\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].event, None);
        assert_eq!(frames[1].data, "two");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_mixed_delimiters() {
        let mut buf = String::from("data: a\r\n\r\ndata: b\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }

    #[test]
    fn drain_partial_frame_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "complete");
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn drain_joins_multiple_data_lines() {
        let mut buf = String::from("data: line one\ndata: line two\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line one\nline two");
    }

    #[test]
    fn drain_suppresses_empty_data() {
        let mut buf = String::from("data: \n\nevent: keepalive\n\n");
        let frames = drain_frames(&mut buf);
        assert!(frames.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_suppresses_done_sentinel() {
        let mut buf = String::from("data: [DONE]\n\n");
        let frames = drain_frames(&mut buf);
        assert!(frames.is_empty());
    }

    #[test]
    fn drain_ignores_id_and_retry_lines() {
        let mut buf = String::from("event: ev\nid: 42\nretry: 5000\ndata: payload\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "payload");
    }

    #[test]
    fn drain_incremental_buffering() {
        let mut buf = String::from("data: chunk1");
        assert!(drain_frames(&mut buf).is_empty());
        assert_eq!(buf, "data: chunk1");

        buf.push_str("\n\ndata: chunk2\n\n");
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "chunk1");
        assert_eq!(frames[1].data, "chunk2");
        assert!(buf.is_empty());
    }

    #[test]
    fn delimiter_split_across_chunks() {
        let mut buf = String::from("data: x\r\n\r");
        assert!(drain_frames(&mut buf).is_empty());
        buf.push('\n');
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn reassembly_reproduces_input_up_to_partial_suffix() {
        let input = "event: a\ndata: one\n\ndata: two\n\ndata: trunc";
        let mut buf = String::from(input);
        let frames = drain_frames(&mut buf);
        let rebuilt: String = frames
            .iter()
            .map(|f| {
                let mut s = String::new();
                if let Some(ev) = &f.event {
                    s.push_str(&format!("event: {ev}\n"));
                }
                s.push_str(&format!("data: {}\n\n", f.data));
                s
            })
            .collect();
        assert_eq!(format!("{rebuilt}{buf}"), input);
    }
}
