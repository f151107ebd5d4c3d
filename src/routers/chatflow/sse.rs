//! SSE infrastructure for the chat-flow adapter
//!
//! Inbound: reassembles the backend's newline-delimited `data:` frames from
//! arbitrarily chunked bytes and decodes them into [`BackendFrame`]s.
//! Outbound: formats OpenAI-shaped SSE frames and the response envelope.

use std::io;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use memchr::memchr;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::events::BackendFrame;

// ============================================================================
// Constants
// ============================================================================

/// Maximum buffered bytes awaiting a line terminator (1 MB). A backend that
/// streams data without newlines fails the request instead of growing the
/// buffer without bound.
const MAX_STREAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Terminal sentinel frame closing every SSE response.
pub(crate) const DONE_FRAME: &str = "data: [DONE]\n\n";

// ============================================================================
// Frame reassembly
// ============================================================================

/// The backend buffered more than [`MAX_STREAM_BUFFER_SIZE`] bytes without a
/// line terminator.
#[derive(Debug, Error)]
#[error("stream buffer exceeded maximum size without a frame delimiter")]
pub(crate) struct FrameOverflow;

/// Reassembles complete protocol frames from an arbitrarily chunked byte
/// stream.
///
/// Bytes accumulate until a line feed; every complete line is decoded
/// independently, so a frame split across any chunk boundary (including
/// mid-UTF-8-sequence) decodes identically to an unsplit one.
#[derive(Default)]
pub(crate) struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Consume one byte chunk and return the frames completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<BackendFrame>, FrameOverflow> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = memchr(b'\n', &self.buffer[start..]) {
            let line_end = start + offset;
            if let Some(frame) = decode_line(&self.buffer[start..line_end]) {
                frames.push(frame);
            }
            start = line_end + 1;
        }
        self.buffer.drain(..start);

        if self.buffer.len() > MAX_STREAM_BUFFER_SIZE {
            return Err(FrameOverflow);
        }

        Ok(frames)
    }

    /// Signal end of stream. A trailing fragment that never received its line
    /// terminator is discarded, never parsed.
    pub(crate) fn finish(self) {
        if !self.buffer.is_empty() {
            debug!(
                discarded_bytes = self.buffer.len(),
                "Discarding unterminated trailing fragment at end of backend stream"
            );
        }
    }
}

/// Decode one complete line into a frame.
///
/// Blank lines, lines without the `data:` prefix, and lines whose payload is
/// not valid JSON are all skipped; backends interleave keep-alive and comment
/// lines with real frames.
fn decode_line(raw: &[u8]) -> Option<BackendFrame> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            debug!(error = %e, "Skipping non-UTF-8 stream line");
            return None;
        }
    };

    if line.is_empty() {
        return None;
    }

    let payload = match line.strip_prefix("data:") {
        Some(payload) => payload.trim_start(),
        None => {
            debug!(line = %line, "Skipping stream line without data prefix");
            return None;
        }
    };

    match serde_json::from_str(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!(error = %e, "Skipping undecodable frame payload");
            None
        }
    }
}

// ============================================================================
// SSE event formatting and sending
// ============================================================================

/// Format a payload as one SSE frame: `data: <json>\n\n`.
pub(crate) fn format_sse_frame<T: Serialize>(payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

/// Send raw SSE bytes through the channel.
///
/// Returns `true` if the send succeeded, `false` if the receiver was dropped
/// (the caller disconnected).
pub(crate) async fn send_bytes(
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    bytes: Bytes,
) -> bool {
    tx.send(Ok(bytes)).await.is_ok()
}

/// Build the streaming response envelope around an SSE body.
pub(crate) fn build_sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|e| {
            error!("Failed to build streaming response: {}", e);
            crate::routers::error::internal_error(
                "response_build_failed",
                "Failed to build response",
            )
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routers::chatflow::events::{classify, NormalizedEvent, ResponseMode};

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Vec<NormalizedEvent> {
        decoder
            .push(bytes)
            .unwrap()
            .into_iter()
            .flat_map(|f| classify(f, ResponseMode::Aggregate, None))
            .collect()
    }

    #[test]
    fn test_decode_two_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"data: {\"event\":\"message\",\"answer\":\"Hi\"}\ndata: {\"event\":\"ping\"}\n",
        );
        assert_eq!(
            events,
            vec![
                NormalizedEvent::ContentDelta("Hi".into()),
                NormalizedEvent::Ignored,
            ]
        );
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        // Multibyte content so splits inside a UTF-8 sequence are exercised.
        let stream: &[u8] = "data: {\"event\":\"message\",\"answer\":\"héllo — ∆\"}\n\
                             data: {\"event\":\"text_chunk\",\"data\":{\"text\":\"wörld\"}}\n\
                             data: {\"event\":\"message_end\",\"metadata\":{\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}}\n"
            .as_bytes();

        let mut reference_decoder = FrameDecoder::new();
        let reference = decode_all(&mut reference_decoder, stream);
        assert_eq!(reference.len(), 4); // two deltas + usage + finished

        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut events = decode_all(&mut decoder, &stream[..split]);
            events.extend(decode_all(&mut decoder, &stream[split..]));
            assert_eq!(events, reference, "split at byte {}", split);
        }
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(&mut decoder, b"data:{\"event\":\"message\",\"answer\":\"x\"}\n");
        assert_eq!(events, vec![NormalizedEvent::ContentDelta("x".into())]);
    }

    #[test]
    fn test_lines_without_data_prefix_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"event: message\n: keep-alive\ndata: {\"event\":\"message\",\"answer\":\"ok\"}\n",
        );
        assert_eq!(events, vec![NormalizedEvent::ContentDelta("ok".into())]);
    }

    #[test]
    fn test_malformed_json_line_is_not_fatal() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"data: {not json\ndata: {\"event\":\"message\",\"answer\":\"still here\"}\n",
        );
        assert_eq!(
            events,
            vec![NormalizedEvent::ContentDelta("still here".into())]
        );
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let mut decoder = FrameDecoder::new();
        let events = decode_all(
            &mut decoder,
            b"\r\n\ndata: {\"event\":\"message\",\"answer\":\"crlf\"}\r\n",
        );
        assert_eq!(events, vec![NormalizedEvent::ContentDelta("crlf".into())]);
    }

    #[test]
    fn test_unterminated_tail_is_never_parsed() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push(b"data: {\"event\":\"message\",\"answer\":\"lost\"}")
            .unwrap();
        assert!(frames.is_empty());
        decoder.finish();
    }

    #[test]
    fn test_buffer_overflow_fails_the_stream() {
        let mut decoder = FrameDecoder::new();
        let chunk = vec![b'x'; MAX_STREAM_BUFFER_SIZE + 1];
        assert!(decoder.push(&chunk).is_err());
    }

    #[test]
    fn test_format_sse_frame() {
        let bytes = format_sse_frame(&serde_json::json!({"ok": true}));
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"ok\":true"));
    }

    #[test]
    fn test_done_frame_shape() {
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
    }
}
