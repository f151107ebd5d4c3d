//! Gateway configuration
//!
//! All knobs are CLI flags with `FLOWGATE_*` environment fallbacks.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "flowgate",
    version,
    about = "OpenAI-compatible gateway for chat-flow conversation backends"
)]
pub struct GatewayConfig {
    /// Address to bind the HTTP server on.
    #[arg(long, env = "FLOWGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP server on.
    #[arg(long, env = "FLOWGATE_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Base URL of the backend API, e.g. https://backend.example.com/v1.
    #[arg(long, env = "FLOWGATE_BACKEND_URL")]
    pub backend_url: String,

    /// Backend API key used when callers do not supply a bearer token.
    #[arg(long, env = "FLOWGATE_BACKEND_API_KEY")]
    pub backend_api_key: Option<String>,

    /// Default workflow output variable; a per-request `output_variable`
    /// takes precedence.
    #[arg(long, env = "FLOWGATE_OUTPUT_VARIABLE")]
    pub output_variable: Option<String>,

    /// Model name advertised on /v1/models.
    #[arg(long, env = "FLOWGATE_SERVED_MODEL_NAME", default_value = "chatflow")]
    pub served_model_name: String,

    /// Upper bound in seconds on one backend exchange, streaming included.
    #[arg(long, env = "FLOWGATE_REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    /// Backend base URL without trailing slashes.
    pub fn backend_url(&self) -> String {
        self.backend_url.trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backend_url: &str) -> Self {
        Self::parse_from(["flowgate", "--backend-url", backend_url])
    }
}
