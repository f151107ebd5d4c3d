//! Chat Completions API protocol definitions
//!
//! Rust types for the OpenAI `/v1/chat/completions` endpoint: the inbound
//! request (including multimodal content parts) and both response framings,
//! the aggregated `chat.completion` object and the `chat.completion.chunk`
//! objects emitted over SSE.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::Usage;

/// `object` field of an aggregated completion response.
pub const CHAT_COMPLETION_OBJECT: &str = "chat.completion";

/// `object` field of a streamed completion chunk.
pub const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

/// `finish_reason` reported when generation ran to completion.
pub const FINISH_REASON_STOP: &str = "stop";

// ============================================================================
// Request Types
// ============================================================================

/// Request to create a chat completion.
///
/// Sampling parameters the gateway has no use for (temperature, top_p, ...)
/// are accepted and retained in `other` so strict OpenAI SDK clients are not
/// rejected.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model label, opaque to the gateway and echoed back verbatim.
    pub model: String,

    /// Ordered conversation turns.
    pub messages: Vec<ChatMessage>,

    /// Whether to stream back partial progress as SSE chunks.
    #[serde(default)]
    pub stream: bool,

    /// Selects one output of a workflow-style backend run; when absent the
    /// whole outputs object is used.
    pub output_variable: Option<String>,

    /// Additional OpenAI parameters this gateway does not interpret.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Message content: plain text or an ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One typed content part of a multimodal message.
///
/// Unrecognized part types land in `Unknown` so the gateway can reject them
/// with a proper 400 instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(untagged)]
    Unknown(Value),
}

/// Image reference: an `http(s)` URL or an inline base64 data URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

// ============================================================================
// Response Types
// ============================================================================

/// Aggregated (non-streaming) chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String, // "chat.completion"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    pub system_fingerprint: Option<String>,
}

/// A single aggregated choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    /// Always serialized, `null` when absent, matching the OpenAI shape.
    pub logprobs: Option<Value>,
    pub finish_reason: Option<String>, // "stop", "length", ...
}

/// The assistant message inside an aggregated choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: Role,
    pub content: String,
}

// ============================================================================
// Streaming Types
// ============================================================================

/// One streamed chunk of a chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    pub object: String, // "chat.completion.chunk"
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatStreamChoice>,
}

/// A single streamed choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    /// Always serialized, `null` until the terminal chunk.
    pub finish_reason: Option<String>,
}

/// Incremental message delta; the terminal chunk carries an empty delta.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
}

impl ChatCompletionStreamResponse {
    /// Build a single-choice chunk, the only shape this gateway emits.
    pub fn new(
        id: &str,
        created: u64,
        model: &str,
        delta: ChatMessageDelta,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.to_string(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}
