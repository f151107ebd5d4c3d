//! Streaming processor
//!
//! Bridges the backend byte stream onto an OpenAI `chat.completion.chunk`
//! SSE stream. All output goes through [`ResponseStreamState`], whose `ended`
//! flag moves false→true exactly once; whatever the backend sends after its
//! first terminal frame, the caller sees one termination sequence.

use std::{io, sync::Arc};

use axum::{body::Body, response::Response};
use bytes::Bytes;
use futures_util::StreamExt;
use openai_protocol::chat::{
    ChatCompletionRequest, ChatCompletionStreamResponse, ChatMessageDelta, Role,
    FINISH_REASON_STOP,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    events::{classify, BackendFrame, NormalizedEvent, ResponseMode},
    router,
    sse::{self, FrameDecoder},
};
use crate::server::AppContext;

/// Channel buffer size for SSE events sent to the caller.
const SSE_CHANNEL_SIZE: usize = 128;

/// Caller-facing message for mid-stream failures; backend specifics stay in
/// the logs.
const STREAM_ERROR_MESSAGE: &str = "The backend stream reported an error";

// ============================================================================
// Per-request stream state
// ============================================================================

/// Owner of one request's output channel and terminal guard.
pub(crate) struct ResponseStreamState {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    id: String,
    created: u64,
    model: String,
    first_delta: bool,
    ended: bool,
}

impl ResponseStreamState {
    pub(crate) fn new(
        tx: mpsc::Sender<Result<Bytes, io::Error>>,
        id: String,
        created: u64,
        model: String,
    ) -> Self {
        Self {
            tx,
            id,
            created,
            model,
            first_delta: true,
            ended: false,
        }
    }

    pub(crate) fn ended(&self) -> bool {
        self.ended
    }

    /// Send one content delta chunk.
    ///
    /// Returns `false` when no further output is possible: the stream already
    /// ended, or the caller disconnected.
    pub(crate) async fn send_delta(&mut self, text: String) -> bool {
        if self.ended {
            return false;
        }

        let role = if self.first_delta {
            self.first_delta = false;
            Some(Role::Assistant)
        } else {
            None
        };
        let chunk = ChatCompletionStreamResponse::new(
            &self.id,
            self.created,
            &self.model,
            ChatMessageDelta {
                role,
                content: Some(text),
            },
            None,
        );
        sse::send_bytes(&self.tx, sse::format_sse_frame(&chunk)).await
    }

    /// Emit the terminal chunk and the `[DONE]` sentinel. Idempotent.
    pub(crate) async fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let chunk = ChatCompletionStreamResponse::new(
            &self.id,
            self.created,
            &self.model,
            ChatMessageDelta::default(),
            Some(FINISH_REASON_STOP.to_string()),
        );
        if sse::send_bytes(&self.tx, sse::format_sse_frame(&chunk)).await {
            sse::send_bytes(&self.tx, Bytes::from_static(sse::DONE_FRAME.as_bytes())).await;
        }
    }

    /// Emit an error-shaped frame and the `[DONE]` sentinel. Idempotent.
    pub(crate) async fn fail(&mut self, message: &str) {
        if self.ended {
            return;
        }
        self.ended = true;

        let payload = serde_json::json!({
            "error": {
                "message": message,
                "type": "api_error",
                "code": "stream_error"
            }
        });
        if sse::send_bytes(&self.tx, sse::format_sse_frame(&payload)).await {
            sse::send_bytes(&self.tx, Bytes::from_static(sse::DONE_FRAME.as_bytes())).await;
        }
    }
}

// ============================================================================
// Streaming execution
// ============================================================================

/// Execute a streaming chat completion request.
pub(crate) async fn execute(
    ctx: Arc<AppContext>,
    token: String,
    request: ChatCompletionRequest,
) -> Response {
    let backend_response = match router::dispatch_to_backend(&ctx, &token, &request).await {
        Ok(response) => response,
        Err(response) => return response,
    };

    let output_variable = router::output_variable(&ctx, &request);
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(SSE_CHANNEL_SIZE);
    let state = ResponseStreamState::new(
        tx,
        router::completion_id(),
        router::unix_timestamp(),
        request.model.clone(),
    );

    tokio::spawn(async move {
        consume_backend_stream(backend_response, state, output_variable).await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    sse::build_sse_response(Body::from_stream(stream))
}

/// Whether to keep feeding frames after this one.
enum StreamStep {
    Continue,
    Stop,
}

/// Drive the backend byte stream through the decoder and state machine.
async fn consume_backend_stream(
    response: reqwest::Response,
    mut state: ResponseStreamState,
    output_variable: Option<String>,
) {
    let mut decoder = FrameDecoder::new();
    let mut stream = response.bytes_stream();

    'consume: while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Backend stream read failed");
                state.fail(STREAM_ERROR_MESSAGE).await;
                return;
            }
        };

        let frames = match decoder.push(&chunk) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Backend stream framing failed");
                state.fail(STREAM_ERROR_MESSAGE).await;
                return;
            }
        };

        for frame in frames {
            if let StreamStep::Stop =
                apply_frame(&mut state, frame, output_variable.as_deref()).await
            {
                // Dropping the response releases the backend stream.
                break 'consume;
            }
        }
    }

    decoder.finish();

    // Backend closed without a terminal frame; terminate the output anyway.
    if !state.ended() {
        state.finish().await;
    }
}

/// Feed one decoded frame through the state machine.
async fn apply_frame(
    state: &mut ResponseStreamState,
    frame: BackendFrame,
    output_variable: Option<&str>,
) -> StreamStep {
    for event in classify(frame, ResponseMode::Streaming, output_variable) {
        match event {
            NormalizedEvent::ContentDelta(text) => {
                if !state.send_delta(text).await {
                    debug!("Caller disconnected, dropping backend stream");
                    return StreamStep::Stop;
                }
            }
            NormalizedEvent::Finished => {
                state.finish().await;
                return StreamStep::Stop;
            }
            NormalizedEvent::Error(_) => {
                // Specifics were logged at classification time.
                state.fail(STREAM_ERROR_MESSAGE).await;
                return StreamStep::Stop;
            }
            // Chunks carry no usage field; nothing to forward.
            NormalizedEvent::Usage(_) | NormalizedEvent::Ignored => {}
        }
    }
    StreamStep::Continue
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn test_state(
        capacity: usize,
    ) -> (
        ResponseStreamState,
        mpsc::Receiver<Result<Bytes, io::Error>>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            ResponseStreamState::new(tx, "chatcmpl-test".into(), 1700000000, "m".into()),
            rx,
        )
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(item) = rx.recv().await {
            frames.push(String::from_utf8(item.unwrap().to_vec()).unwrap());
        }
        frames
    }

    fn frame_json(frame: &str) -> Value {
        let payload = frame
            .strip_prefix("data: ")
            .unwrap()
            .trim_end();
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn test_terminal_sequence_is_emitted_exactly_once() {
        let (mut state, rx) = test_state(16);

        assert!(state.send_delta("Hi".into()).await);
        state.finish().await;
        // Late terminals and content must all be suppressed.
        state.finish().await;
        state.fail("late").await;
        assert!(!state.send_delta("late".into()).await);
        assert!(state.ended());
        drop(state);

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 3);

        let delta = frame_json(&frames[0]);
        assert_eq!(delta["object"], "chat.completion.chunk");
        assert_eq!(delta["choices"][0]["delta"]["content"], "Hi");
        assert!(delta["choices"][0]["finish_reason"].is_null());

        let terminal = frame_json(&frames[1]);
        assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            terminal["choices"][0]["delta"],
            serde_json::json!({})
        );

        assert_eq!(frames[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_first_delta_carries_role() {
        let (mut state, rx) = test_state(16);
        state.send_delta("a".into()).await;
        state.send_delta("b".into()).await;
        drop(state);

        let frames = drain(rx).await;
        assert_eq!(
            frame_json(&frames[0])["choices"][0]["delta"]["role"],
            "assistant"
        );
        assert!(frame_json(&frames[1])["choices"][0]["delta"]
            .get("role")
            .is_none());
    }

    #[tokio::test]
    async fn test_error_frame_then_done() {
        let (mut state, rx) = test_state(16);
        state.fail(STREAM_ERROR_MESSAGE).await;
        drop(state);

        let frames = drain(rx).await;
        assert_eq!(frames.len(), 2);
        let error = frame_json(&frames[0]);
        assert_eq!(error["error"]["code"], "stream_error");
        assert_eq!(error["error"]["message"], STREAM_ERROR_MESSAGE);
        assert_eq!(frames[1], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_double_terminal_frames_close_once() {
        let (mut state, rx) = test_state(16);

        let frames: Vec<BackendFrame> = [
            r#"{"event":"message","answer":"Hi"}"#,
            r#"{"event":"message_end","metadata":{"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}}"#,
            // Late second terminal after the stream already ended.
            r#"{"event":"workflow_finished","data":{"outputs":{"answer":"Hi"}}}"#,
        ]
        .iter()
        .map(|json| serde_json::from_str(json).unwrap())
        .collect();

        for frame in frames {
            apply_frame(&mut state, frame, None).await;
        }
        drop(state);

        let frames = drain(rx).await;
        let done_count = frames.iter().filter(|f| *f == "data: [DONE]\n\n").count();
        assert_eq!(done_count, 1);
        assert_eq!(frames.len(), 3); // delta + terminal chunk + [DONE]
    }

    #[tokio::test]
    async fn test_error_event_stops_the_stream() {
        let (mut state, rx) = test_state(16);

        let error_frame: BackendFrame =
            serde_json::from_str(r#"{"event":"error","code":"boom","message":"secret detail"}"#)
                .unwrap();
        assert!(matches!(
            apply_frame(&mut state, error_frame, None).await,
            StreamStep::Stop
        ));
        drop(state);

        let frames = drain(rx).await;
        // Backend specifics must not reach the caller.
        assert!(!frames[0].contains("secret detail"));
        assert_eq!(frames[1], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_disconnected_caller_stops_production() {
        let (mut state, rx) = test_state(16);
        drop(rx);
        assert!(!state.send_delta("anyone there?".into()).await);
    }
}
