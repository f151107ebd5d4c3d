//! Backend HTTP transport
//!
//! Sends the normalized chat request and hands the raw byte stream to the
//! response processors. Non-2xx responses never enter the streaming
//! pipeline; their status and body are captured for verbatim passthrough.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{request::BackendQuery, AdapterError};

/// Maximum error response body read into memory (1 MB).
const MAX_ERROR_RESPONSE_SIZE: usize = 1024 * 1024;

/// Send one chat request to the backend, returning the streaming response.
pub(crate) async fn send_chat_request(
    http_client: &reqwest::Client,
    base_url: &str,
    token: &str,
    query: &BackendQuery,
    timeout: Duration,
) -> Result<reqwest::Response, AdapterError> {
    let url = format!("{}/chat-messages", base_url);
    debug!(url = %url, "Sending request to backend");

    let response = http_client
        .post(&url)
        .bearer_auth(token)
        .json(query)
        .timeout(timeout)
        .send()
        .await?;

    let status = response.status();
    debug!(url = %url, status = %status, "Received response from backend");

    if !status.is_success() {
        let body = read_error_body(response).await;
        warn!(
            status = %status,
            body_preview = %body.chars().take(200).collect::<String>(),
            "Backend rejected request"
        );
        return Err(AdapterError::BackendRejected { status, body });
    }

    Ok(response)
}

/// Read a non-2xx response body for passthrough, substituting a placeholder
/// when it is empty, oversized, or unreadable.
pub(crate) async fn read_error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match read_response_body_limited(response, MAX_ERROR_RESPONSE_SIZE).await {
        ReadBodyResult::Ok(body) if body.is_empty() => {
            format!("Backend returned error: {}", status)
        }
        ReadBodyResult::Ok(body) => body,
        ReadBodyResult::TooLarge => {
            warn!(
                status = %status,
                max_size = %MAX_ERROR_RESPONSE_SIZE,
                "Error response body too large"
            );
            format!("Backend returned error: {} (response too large)", status)
        }
        ReadBodyResult::Error(e) => {
            warn!(status = %status, error = %e, "Failed to read error response body");
            format!("Backend returned error: {}", status)
        }
    }
}

/// Result of reading a response body with a size limit.
enum ReadBodyResult {
    Ok(String),
    TooLarge,
    Error(String),
}

/// Read a response body incrementally, bailing out once `max_size` is
/// exceeded so chunked responses of unknown length cannot exhaust memory.
async fn read_response_body_limited(response: reqwest::Response, max_size: usize) -> ReadBodyResult {
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk_result) = stream.next().await {
        match chunk_result {
            Ok(chunk) => {
                if buf.len() + chunk.len() > max_size {
                    return ReadBodyResult::TooLarge;
                }
                buf.extend_from_slice(&chunk);
            }
            Err(e) => return ReadBodyResult::Error(e.to_string()),
        }
    }

    // Decode once at the end; a multibyte sequence may straddle chunks.
    match String::from_utf8(buf) {
        Ok(body) => ReadBodyResult::Ok(body),
        Err(e) => ReadBodyResult::Error(format!("invalid UTF-8 in response body: {}", e)),
    }
}
