//! HTTP application assembly
//!
//! Builds the axum app around a shared [`AppContext`] and runs it with
//! graceful shutdown.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use openai_protocol::common::{ModelInfo, ModelList};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{config::GatewayConfig, routers::chatflow};

/// Shared per-process state: configuration and the pooled HTTP client.
pub struct AppContext {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
}

impl AppContext {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, client })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(config: GatewayConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

/// Assemble the router with all exposed endpoints.
pub fn build_app(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route(
            "/v1/chat/completions",
            post(chatflow::router::chat_completions),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health() -> &'static str {
    "ok"
}

/// Advertise the configured model so OpenAI SDK clients can discover it.
async fn list_models(State(ctx): State<Arc<AppContext>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: ctx.config.served_model_name.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "flowgate".to_string(),
        }],
    })
}

/// Bind and serve until a shutdown signal arrives.
pub async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let ctx = Arc::new(AppContext::new(config)?);
    let app = build_app(ctx);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
