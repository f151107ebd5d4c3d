//! Attachment resolution for multimodal content
//!
//! Remote image URLs pass through untouched; inline base64 data URLs are
//! decoded and handed to the backend's file-upload endpoint, which returns
//! the reference the chat request carries instead of the raw bytes.

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{client, AdapterError};

static DATA_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:(?P<mime>[^;,]+);base64,(?P<data>.+)$").unwrap());

/// A resolved image attachment, serialized into the backend `files` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transfer_method", rename_all = "snake_case")]
pub(crate) enum Attachment {
    RemoteUrl {
        url: String,
    },
    #[serde(rename = "local_file")]
    UploadedRef {
        #[serde(rename = "upload_file_id")]
        id: String,
    },
}

/// Upload collaborator: raw bytes in, backend file reference out.
#[async_trait]
pub(crate) trait AttachmentUploader: Send + Sync {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: &str,
        user: &str,
    ) -> Result<String, AdapterError>;
}

/// Uploader backed by the backend's multipart file-upload endpoint.
pub(crate) struct BackendUploader {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

impl BackendUploader {
    pub(crate) fn new(client: reqwest::Client, base_url: String, token: String) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }
}

#[async_trait]
impl AttachmentUploader for BackendUploader {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        file_name: &str,
        user: &str,
    ) -> Result<String, AdapterError> {
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| {
                AdapterError::InvalidInlineData(format!("unsupported media type {mime_type}: {e}"))
            })?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("user", user.to_string());

        let url = format!("{}/files/upload", self.base_url);
        debug!(url = %url, mime = %mime_type, file_name = %file_name, "Uploading inline attachment");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = client::read_error_body(response).await;
            return Err(AdapterError::UploadFailed { status, body });
        }

        let uploaded: UploadedFile = response.json().await?;
        debug!(file_id = %uploaded.id, "Attachment uploaded");
        Ok(uploaded.id)
    }
}

/// Resolve one image reference into an [`Attachment`].
///
/// `http(s)` URLs resolve without I/O; anything else must be a base64 data
/// URL and goes through the uploader.
pub(crate) async fn resolve(
    url: &str,
    user: &str,
    uploader: &dyn AttachmentUploader,
) -> Result<Attachment, AdapterError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Attachment::RemoteUrl {
            url: url.to_string(),
        });
    }

    let (mime_type, bytes) = parse_data_url(url)?;
    let file_name = file_name_for(&mime_type);
    let id = uploader.upload(bytes, &mime_type, &file_name, user).await?;
    Ok(Attachment::UploadedRef { id })
}

/// Parse a `data:<mime>;base64,<payload>` URL into mime type and raw bytes.
pub(crate) fn parse_data_url(url: &str) -> Result<(String, Vec<u8>), AdapterError> {
    let captures = DATA_URL_RE.captures(url).ok_or_else(|| {
        AdapterError::InvalidInlineData(
            "image payload is neither an http(s) URL nor a base64 data URL".to_string(),
        )
    })?;

    let mime_type = normalize_mime(&captures["mime"]);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(captures["data"].as_bytes())
        .map_err(|e| {
            warn!(error = %e, "Inline image payload is not valid base64");
            AdapterError::InvalidInlineData(format!("invalid base64 payload: {e}"))
        })?;

    Ok((mime_type, bytes))
}

/// Lowercase the mime type and fold the `image/jpg` alias into `image/jpeg`.
fn normalize_mime(mime: &str) -> String {
    if mime.eq_ignore_ascii_case("image/jpg") {
        "image/jpeg".to_string()
    } else {
        mime.to_ascii_lowercase()
    }
}

/// Derive an upload filename from the mime subtype.
fn file_name_for(mime_type: &str) -> String {
    let subtype = mime_type.split('/').nth(1).unwrap_or("bin");
    format!("image.{}", subtype)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records the upload call instead of performing I/O.
    struct RecordingUploader {
        seen: Mutex<Option<(usize, String, String, String)>>,
    }

    impl RecordingUploader {
        fn new() -> Self {
            Self {
                seen: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl AttachmentUploader for RecordingUploader {
        async fn upload(
            &self,
            bytes: Vec<u8>,
            mime_type: &str,
            file_name: &str,
            user: &str,
        ) -> Result<String, AdapterError> {
            *self.seen.lock().unwrap() = Some((
                bytes.len(),
                mime_type.to_string(),
                file_name.to_string(),
                user.to_string(),
            ));
            Ok("file-123".to_string())
        }
    }

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
            panic!("remote URLs must resolve without an upload");
        }
    }

    #[tokio::test]
    async fn test_remote_url_passes_through_without_io() {
        let attachment = resolve("https://example.com/cat.png", "u1", &RejectingUploader)
            .await
            .unwrap();
        assert_eq!(
            attachment,
            Attachment::RemoteUrl {
                url: "https://example.com/cat.png".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_inline_jpg_uploads_as_normalized_jpeg() {
        // "hello" base64-encoded
        let uploader = RecordingUploader::new();
        let attachment = resolve("data:image/jpg;base64,aGVsbG8=", "u1", &uploader)
            .await
            .unwrap();

        assert_eq!(
            attachment,
            Attachment::UploadedRef {
                id: "file-123".to_string()
            }
        );
        let seen = uploader.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen, (5, "image/jpeg".into(), "image.jpeg".into(), "u1".into()));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_invalid_inline_data() {
        let err = resolve("ftp://example.com/cat.png", "u1", &RejectingUploader)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidInlineData(_)));

        let err = resolve("data:image/png;base64,!!not-base64!!", "u1", &RejectingUploader)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidInlineData(_)));
    }

    #[test]
    fn test_parse_data_url_png() {
        let (mime, bytes) = parse_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_attachment_wire_shapes() {
        let remote = serde_json::to_value(Attachment::RemoteUrl {
            url: "https://example.com/a.png".into(),
        })
        .unwrap();
        assert_eq!(
            remote,
            serde_json::json!({"transfer_method": "remote_url", "url": "https://example.com/a.png"})
        );

        let uploaded = serde_json::to_value(Attachment::UploadedRef {
            id: "file-123".into(),
        })
        .unwrap();
        assert_eq!(
            uploaded,
            serde_json::json!({"transfer_method": "local_file", "upload_file_id": "file-123"})
        );
    }
}
