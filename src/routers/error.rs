//! OpenAI-shaped error responses
//!
//! Every gateway-originated failure renders as `{"error": {...}}` with a
//! machine-readable code, mirrored into a response header so proxies and
//! tests can read it without parsing the body.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    error_type: &'static str,
    code: &'a str,
    param: Option<String>,
}

pub const HEADER_X_FLOWGATE_ERROR_CODE: &str = "X-Flowgate-Error-Code";

pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Response {
    create_error(StatusCode::BAD_REQUEST, code, message)
}

pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Response {
    create_error(StatusCode::UNAUTHORIZED, code, message)
}

pub fn internal_error(code: impl Into<String>, message: impl Into<String>) -> Response {
    create_error(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Response {
    create_error(StatusCode::BAD_GATEWAY, code, message)
}

pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Response {
    create_error(StatusCode::GATEWAY_TIMEOUT, code, message)
}

pub fn create_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    let code_str = code.into();
    let message_str = message.into();

    let mut headers = HeaderMap::with_capacity(1);
    if let Ok(val) = HeaderValue::from_str(&code_str) {
        headers.insert(HEADER_X_FLOWGATE_ERROR_CODE, val);
    }

    (
        status,
        headers,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: &message_str,
                error_type: error_type_for(status),
                code: &code_str,
                param: None,
            },
        }),
    )
        .into_response()
}

/// OpenAI error `type` discriminator for a status code.
fn error_type_for(status: StatusCode) -> &'static str {
    if status == StatusCode::UNAUTHORIZED {
        "authentication_error"
    } else if status.is_client_error() {
        "invalid_request_error"
    } else {
        "api_error"
    }
}
