//! Backend event model and classification
//!
//! The backend's streaming protocol interleaves several event kinds under an
//! `event` discriminator. Frames decode into [`BackendFrame`] and a single
//! exhaustive match turns each frame into the [`NormalizedEvent`]s the
//! response assemblers consume. Unknown discriminators map to `Ignored`.

use openai_protocol::common::Usage;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

// ============================================================================
// Constants
// ============================================================================

/// Usage counters substituted when a `workflow_finished` frame omits them,
/// and when an aggregate response ends without any usage frame at all.
pub(crate) const DEFAULT_PROMPT_TOKENS: u32 = 100;
pub(crate) const DEFAULT_COMPLETION_TOKENS: u32 = 10;
pub(crate) const DEFAULT_TOTAL_TOKENS: u32 = 110;

/// Default usage for responses where the backend never reported counters.
pub(crate) fn default_usage() -> Usage {
    Usage::new(
        DEFAULT_PROMPT_TOKENS,
        DEFAULT_COMPLETION_TOKENS,
        DEFAULT_TOTAL_TOKENS,
    )
}

// ============================================================================
// Backend frames
// ============================================================================

/// One decoded frame of the backend's streaming protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum BackendFrame {
    Message {
        #[serde(default)]
        answer: String,
    },
    AgentMessage {
        #[serde(default)]
        answer: String,
    },
    TextChunk {
        #[serde(default)]
        data: TextChunkData,
    },
    MessageEnd {
        #[serde(default)]
        metadata: FrameMetadata,
    },
    WorkflowFinished {
        #[serde(default)]
        data: WorkflowData,
        #[serde(default)]
        metadata: FrameMetadata,
    },
    AgentThought,
    Ping,
    Error {
        #[serde(default)]
        status: Option<i64>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TextChunkData {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct WorkflowData {
    #[serde(default)]
    pub outputs: Value,
}

/// Trailing metadata on terminal frames; everything beyond usage is dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FrameMetadata {
    #[serde(default)]
    pub usage: Option<UsageCounters>,
}

/// Raw usage counters as the backend reports them; any field may be absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct UsageCounters {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

// ============================================================================
// Normalized events
// ============================================================================

/// Protocol-agnostic meaning of one backend frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NormalizedEvent {
    ContentDelta(String),
    Finished,
    Usage(Usage),
    Error(String),
    Ignored,
}

/// Which response framing the caller asked for. `workflow_finished` resolves
/// differently between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseMode {
    Streaming,
    Aggregate,
}

/// Map one backend frame onto the normalized events it carries, in emission
/// order.
pub(crate) fn classify(
    frame: BackendFrame,
    mode: ResponseMode,
    output_variable: Option<&str>,
) -> Vec<NormalizedEvent> {
    match frame {
        BackendFrame::Message { answer } | BackendFrame::AgentMessage { answer } => {
            vec![NormalizedEvent::ContentDelta(answer)]
        }
        BackendFrame::TextChunk { data } => vec![NormalizedEvent::ContentDelta(data.text)],
        BackendFrame::MessageEnd { metadata } => {
            let mut events = Vec::with_capacity(2);
            if let Some(counters) = metadata.usage {
                events.push(NormalizedEvent::Usage(Usage::new(
                    counters.prompt_tokens.unwrap_or(0),
                    counters.completion_tokens.unwrap_or(0),
                    counters.total_tokens.unwrap_or(0),
                )));
            }
            events.push(NormalizedEvent::Finished);
            events
        }
        BackendFrame::WorkflowFinished { data, metadata } => {
            let counters = metadata.usage.unwrap_or_default();
            let usage = Usage::new(
                counters.prompt_tokens.unwrap_or(DEFAULT_PROMPT_TOKENS),
                counters.completion_tokens.unwrap_or(DEFAULT_COMPLETION_TOKENS),
                counters.total_tokens.unwrap_or(DEFAULT_TOTAL_TOKENS),
            );
            match mode {
                // Streaming callers already received the content as deltas.
                ResponseMode::Streaming => {
                    vec![NormalizedEvent::Usage(usage), NormalizedEvent::Finished]
                }
                ResponseMode::Aggregate => vec![
                    NormalizedEvent::ContentDelta(resolve_workflow_output(
                        &data.outputs,
                        output_variable,
                    )),
                    NormalizedEvent::Usage(usage),
                    NormalizedEvent::Finished,
                ],
            }
        }
        BackendFrame::AgentThought | BackendFrame::Ping | BackendFrame::Unknown => {
            vec![NormalizedEvent::Ignored]
        }
        BackendFrame::Error {
            status,
            code,
            message,
        } => {
            warn!(
                status = ?status,
                code = ?code,
                message = %message,
                "Backend reported an error event"
            );
            vec![NormalizedEvent::Error(message)]
        }
    }
}

/// Resolve the textual output of a finished workflow run.
///
/// With a selector, the named output is used; otherwise (or when the named
/// output is missing) the whole outputs object is stringified.
fn resolve_workflow_output(outputs: &Value, output_variable: Option<&str>) -> String {
    let selected = match output_variable {
        Some(key) => match outputs.get(key) {
            Some(value) => value,
            None => {
                warn!(output_variable = %key, "Configured output variable missing from workflow outputs");
                outputs
            }
        },
        None => outputs,
    };

    match selected {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
