//! Protocol adapter between the OpenAI chat surface and the chat-flow backend
//!
//! Request side: normalize the multi-turn OpenAI request into the backend's
//! single-query shape, resolving image content into attachment references.
//! Response side: reassemble the backend's SSE byte stream into typed frames
//! and re-emit them as OpenAI chunks (streaming) or one aggregated response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::warn;

use crate::routers::error;

pub(crate) mod attachments;
pub(crate) mod client;
pub(crate) mod events;
pub(crate) mod non_streaming;
pub(crate) mod request;
pub(crate) mod router;
pub(crate) mod sse;
pub(crate) mod streaming;

/// Failures on the adapter's request path, before any bytes reach the caller.
#[derive(Debug, Error)]
pub(crate) enum AdapterError {
    #[error("malformed message content: {0}")]
    MalformedContent(String),

    #[error("invalid inline image data: {0}")]
    InvalidInlineData(String),

    #[error("attachment upload failed with status {status}")]
    UploadFailed { status: StatusCode, body: String },

    #[error("backend rejected the request with status {status}")]
    BackendRejected { status: StatusCode, body: String },

    #[error("backend transport failure: {0}")]
    BackendTransport(#[from] reqwest::Error),
}

impl AdapterError {
    /// Render this failure as the caller-facing response.
    ///
    /// Backend rejections pass status and body through verbatim; everything
    /// else maps onto the gateway's own error surface.
    pub(crate) fn into_response(self) -> Response {
        match self {
            AdapterError::MalformedContent(message) => {
                error::bad_request("malformed_content", message)
            }
            AdapterError::InvalidInlineData(message) => {
                error::bad_request("invalid_inline_data", message)
            }
            AdapterError::UploadFailed { status, body } => {
                warn!(status = %status, body = %body, "Attachment upload failed");
                error::bad_gateway(
                    "upload_failed",
                    format!("Attachment upload failed with status {}", status),
                )
            }
            AdapterError::BackendRejected { status, body } => (status, body).into_response(),
            AdapterError::BackendTransport(e) => {
                if e.is_timeout() {
                    error::gateway_timeout("timeout", format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    error::bad_gateway("connection_failed", format!("Connection failed: {}", e))
                } else {
                    error::bad_gateway("request_failed", format!("Request failed: {}", e))
                }
            }
        }
    }
}
