//! Request normalization
//!
//! The backend accepts one query string per exchange, so a multi-turn OpenAI
//! request is flattened: the final message becomes the active question, all
//! earlier turns are rendered into a transcript block prepended to it, and
//! image parts of the active turn are resolved into attachment references.

use openai_protocol::chat::{ChatCompletionRequest, ChatMessage, ContentPart, MessageContent};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{
    attachments::{self, Attachment, AttachmentUploader},
    AdapterError,
};

/// Synthetic end-user identifier sent to the backend; no caller identity is
/// available at this layer.
pub(crate) const BACKEND_USER_ID: &str = "flowgate-user";

/// Response mode requested from the backend. Always streaming; aggregation
/// happens gateway-side by draining the stream.
const BACKEND_RESPONSE_MODE: &str = "streaming";

// ============================================================================
// Backend request shape
// ============================================================================

/// The backend's chat request body.
#[derive(Debug, Serialize)]
pub(crate) struct BackendQuery {
    pub inputs: Map<String, Value>,
    pub query: String,
    pub response_mode: &'static str,
    pub conversation_id: String,
    pub user: String,
    pub auto_generate_name: bool,
    pub files: Vec<BackendFile>,
}

impl BackendQuery {
    fn new(query: String, files: Vec<BackendFile>) -> Self {
        Self {
            inputs: Map::new(),
            query,
            response_mode: BACKEND_RESPONSE_MODE,
            // No session continuity is kept across requests.
            conversation_id: String::new(),
            user: BACKEND_USER_ID.to_string(),
            auto_generate_name: false,
            files,
        }
    }
}

/// One entry of the backend `files` array.
#[derive(Debug, Serialize)]
pub(crate) struct BackendFile {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub attachment: Attachment,
}

impl BackendFile {
    fn image(attachment: Attachment) -> Self {
        Self {
            kind: "image",
            attachment,
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Flatten an OpenAI chat request into the backend's single-query shape.
pub(crate) async fn normalize(
    request: &ChatCompletionRequest,
    uploader: &dyn AttachmentUploader,
) -> Result<BackendQuery, AdapterError> {
    let (active, history) = match request.messages.split_last() {
        Some(split) => split,
        None => {
            return Err(AdapterError::MalformedContent(
                "messages must not be empty".to_string(),
            ))
        }
    };

    let (question, image_urls) = split_content(&active.content)?;

    let mut files = Vec::with_capacity(image_urls.len());
    for url in image_urls {
        let attachment = attachments::resolve(url, BACKEND_USER_ID, uploader).await?;
        files.push(BackendFile::image(attachment));
    }

    let history_text = render_history(history)?;
    let query = if history_text.is_empty() {
        question
    } else {
        format!(
            "Here is our talk history:\n'''\n{}\n'''\n\nHere is my question:\n{}",
            history_text, question
        )
    };

    Ok(BackendQuery::new(query, files))
}

/// Render preceding turns as `"{role}: {text}"` lines. Image parts in
/// history are dropped, text only.
fn render_history(messages: &[ChatMessage]) -> Result<String, AdapterError> {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        let (text, _images) = split_content(&message.content)?;
        lines.push(format!("{}: {}", message.role, text));
    }
    Ok(lines.join("\n"))
}

/// Split one message's content into flattened text and image references.
fn split_content(content: &MessageContent) -> Result<(String, Vec<&str>), AdapterError> {
    match content {
        MessageContent::Text(text) => Ok((text.trim().to_string(), Vec::new())),
        MessageContent::Parts(parts) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => texts.push(text.as_str()),
                    ContentPart::ImageUrl { image_url } => images.push(image_url.url.as_str()),
                    ContentPart::Unknown(value) => {
                        return Err(AdapterError::MalformedContent(format!(
                            "content part carries neither text nor an image reference: {}",
                            value
                        )))
                    }
                }
            }
            Ok((texts.join("\n").trim().to_string(), images))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use openai_protocol::chat::ChatCompletionRequest;
    use serde_json::json;

    use super::*;

    /// Fails the test if any upload happens.
    struct RejectingUploader;

    #[async_trait]
    impl AttachmentUploader for RejectingUploader {
        async fn upload(
            &self,
            _bytes: Vec<u8>,
            _mime_type: &str,
            _file_name: &str,
            _user: &str,
        ) -> Result<String, AdapterError> {
            panic!("no upload expected in this test");
        }
    }

    fn request(value: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_single_turn_has_no_transcript() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "  hello  "}]
        }));
        let query = normalize(&req, &RejectingUploader).await.unwrap();
        assert_eq!(query.query, "hello");
        assert!(query.files.is_empty());
    }

    #[tokio::test]
    async fn test_two_turn_history_uses_transcript_template() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "how are you"}
            ]
        }));
        let query = normalize(&req, &RejectingUploader).await.unwrap();
        assert_eq!(
            query.query,
            "Here is our talk history:\n'''\nuser: hi\nassistant: hello\n'''\n\nHere is my question:\nhow are you"
        );
    }

    #[tokio::test]
    async fn test_active_turn_joins_text_parts_and_collects_images() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is"},
                    {"type": "text", "text": "in this picture?"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
                ]
            }]
        }));
        let query = normalize(&req, &RejectingUploader).await.unwrap();
        assert_eq!(query.query, "what is\nin this picture?");
        assert_eq!(query.files.len(), 1);
        assert_eq!(query.files[0].kind, "image");
        assert_eq!(
            query.files[0].attachment,
            Attachment::RemoteUrl {
                url: "https://example.com/cat.png".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_history_images_are_dropped() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look at this"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/old.png"}}
                ]},
                {"role": "assistant", "content": "nice picture"},
                {"role": "user", "content": "thanks"}
            ]
        }));
        let query = normalize(&req, &RejectingUploader).await.unwrap();
        assert!(query.files.is_empty());
        assert!(query.query.contains("user: look at this"));
    }

    #[tokio::test]
    async fn test_unknown_content_part_is_malformed() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "audio", "audio": {"data": "..."}}]
            }]
        }));
        let err = normalize(&req, &RejectingUploader).await.unwrap_err();
        assert!(matches!(err, AdapterError::MalformedContent(_)));
    }

    #[tokio::test]
    async fn test_empty_messages_are_malformed() {
        let req = request(json!({"model": "m", "messages": []}));
        let err = normalize(&req, &RejectingUploader).await.unwrap_err();
        assert!(matches!(err, AdapterError::MalformedContent(_)));
    }

    #[tokio::test]
    async fn test_backend_query_wire_shape() {
        let req = request(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe"},
                    {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
                ]
            }]
        }));
        let query = normalize(&req, &RejectingUploader).await.unwrap();
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            json!({
                "inputs": {},
                "query": "describe",
                "response_mode": "streaming",
                "conversation_id": "",
                "user": BACKEND_USER_ID,
                "auto_generate_name": false,
                "files": [{
                    "type": "image",
                    "transfer_method": "remote_url",
                    "url": "https://example.com/a.png"
                }]
            })
        );
    }
}
