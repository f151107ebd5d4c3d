//! Chat completions entry point
//!
//! Extracts backend credentials, logs the exchange, and hands the request to
//! the streaming or aggregate processor. The backend dispatch shared by both
//! processors also lives here.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::Response,
    Json,
};
use openai_protocol::chat::ChatCompletionRequest;
use tracing::info;
use uuid::Uuid;

use super::{
    attachments::BackendUploader, client, non_streaming, request as normalizer, streaming,
    AdapterError,
};
use crate::{routers::error, server::AppContext};

/// Handle `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let Some(token) = backend_token(&ctx, &headers) else {
        return error::unauthorized(
            "missing_api_key",
            "Provide a backend API key as a bearer token",
        );
    };

    info!(
        model = %request.model,
        streaming = %request.stream,
        messages = %request.messages.len(),
        "Processing chat completion request"
    );

    if request.stream {
        streaming::execute(ctx, token, request).await
    } else {
        non_streaming::execute(ctx, token, request).await
    }
}

/// Bearer token used against the backend: the caller's Authorization header,
/// else configured credentials.
fn backend_token(ctx: &AppContext, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .or_else(|| ctx.config.backend_api_key.clone())
}

/// Normalize the request and dispatch it to the backend, mapping adapter
/// failures to caller-facing responses.
pub(crate) async fn dispatch_to_backend(
    ctx: &AppContext,
    token: &str,
    request: &ChatCompletionRequest,
) -> Result<reqwest::Response, Response> {
    let uploader = BackendUploader::new(
        ctx.client.clone(),
        ctx.config.backend_url(),
        token.to_string(),
    );

    let query = normalizer::normalize(request, &uploader)
        .await
        .map_err(AdapterError::into_response)?;

    client::send_chat_request(
        &ctx.client,
        &ctx.config.backend_url(),
        token,
        &query,
        ctx.config.request_timeout(),
    )
    .await
    .map_err(AdapterError::into_response)
}

/// Effective workflow output selector: per-request wins over configuration.
pub(crate) fn output_variable(
    ctx: &AppContext,
    request: &ChatCompletionRequest,
) -> Option<String> {
    request
        .output_variable
        .clone()
        .or_else(|| ctx.config.output_variable.clone())
}

/// Generated identifier for one completion exchange.
pub(crate) fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub(crate) fn unix_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
