//! Aggregate processor
//!
//! Drains the entire backend stream before replying once: content deltas
//! concatenate, the latest usage wins, and a backend error event turns the
//! whole exchange into a generic failure without leaking backend internals.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use openai_protocol::{
    chat::{
        ChatChoice, ChatCompletionMessage, ChatCompletionRequest, ChatCompletionResponse, Role,
        CHAT_COMPLETION_OBJECT, FINISH_REASON_STOP,
    },
    common::Usage,
};
use tracing::{info, warn};

use super::{
    events::{self, classify, BackendFrame, NormalizedEvent, ResponseMode},
    router,
    sse::FrameDecoder,
};
use crate::{routers::error, server::AppContext};

/// Caller-facing body when the backend stream failed mid-exchange.
const PROCESSING_FAILED_MESSAGE: &str = "Failed to process the backend response";

const SYSTEM_FINGERPRINT: &str = "fp_flowgate";

/// Execute an aggregate (non-streaming) chat completion request.
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
    let aggregate = match drain_stream(backend_response, output_variable.as_deref()).await {
        Ok(aggregate) => aggregate,
        Err(response) => return response,
    };

    let response = assemble_response(&request.model, aggregate);
    info!(
        model = %request.model,
        completion_id = %response.id,
        prompt_tokens = %response.usage.prompt_tokens,
        completion_tokens = %response.usage.completion_tokens,
        "Completed aggregate request"
    );
    (StatusCode::OK, Json(response)).into_response()
}

/// Accumulated state of one aggregate exchange.
#[derive(Debug, Default)]
struct StreamAggregate {
    text: String,
    usage: Option<Usage>,
}

/// Whether to keep feeding frames after this one.
enum AggregateStep {
    Continue,
    Finished,
    Failed,
}

/// Consume the backend byte stream to completion.
async fn drain_stream(
    response: reqwest::Response,
    output_variable: Option<&str>,
) -> Result<StreamAggregate, Response> {
    let mut decoder = FrameDecoder::new();
    let mut stream = response.bytes_stream();
    let mut aggregate = StreamAggregate::default();

    'consume: while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            warn!(error = %e, "Backend stream read failed");
            error::internal_error("processing_failed", PROCESSING_FAILED_MESSAGE)
        })?;

        let frames = decoder.push(&chunk).map_err(|e| {
            warn!(error = %e, "Backend stream framing failed");
            error::internal_error("processing_failed", PROCESSING_FAILED_MESSAGE)
        })?;

        for frame in frames {
            match apply_frame(&mut aggregate, frame, output_variable) {
                AggregateStep::Continue => {}
                AggregateStep::Finished => break 'consume,
                AggregateStep::Failed => {
                    return Err(error::internal_error(
                        "processing_failed",
                        PROCESSING_FAILED_MESSAGE,
                    ))
                }
            }
        }
    }

    decoder.finish();
    Ok(aggregate)
}

/// Fold one decoded frame into the aggregate.
fn apply_frame(
    aggregate: &mut StreamAggregate,
    frame: BackendFrame,
    output_variable: Option<&str>,
) -> AggregateStep {
    for event in classify(frame, ResponseMode::Aggregate, output_variable) {
        match event {
            NormalizedEvent::ContentDelta(text) => aggregate.text.push_str(&text),
            NormalizedEvent::Usage(usage) => aggregate.usage = Some(usage),
            NormalizedEvent::Finished => return AggregateStep::Finished,
            NormalizedEvent::Error(_) => return AggregateStep::Failed,
            NormalizedEvent::Ignored => {}
        }
    }
    AggregateStep::Continue
}

/// Build the single `chat.completion` object for the caller.
fn assemble_response(model: &str, aggregate: StreamAggregate) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: router::completion_id(),
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: router::unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatCompletionMessage {
                role: Role::Assistant,
                content: aggregate.text.trim().to_string(),
            },
            logprobs: None,
            finish_reason: Some(FINISH_REASON_STOP.to_string()),
        }],
        usage: aggregate.usage.unwrap_or_else(events::default_usage),
        system_fingerprint: Some(SYSTEM_FINGERPRINT.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
