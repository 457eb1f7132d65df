mod anthropic;
mod config;
mod error;
mod export;
mod invest;
mod models;
mod parser;
mod pdf;
mod prompt;
mod routes;
mod service;
mod session;
mod validate;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use crate::anthropic::{AnthropicClient, RetryPolicy, Retrying};
use crate::config::AppConfig;
use crate::routes::{router, AppState};
use crate::service::StoryService;
use crate::session::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let generation = config.generation.clone();
    if generation.api_key.is_none() {
        tracing::warn!("⚠️ ANTHROPIC_API_KEY is not set; every generation will fail with an authentication error");
    }
    tracing::info!(
        model = %generation.model,
        base_url = %generation.base_url,
        timeout = ?generation.timeout,
        max_retries = generation.max_retries,
        "Generation client configured"
    );

    let policy = RetryPolicy::from_config(&generation);
    let client = AnthropicClient::new(generation).context("failed to build HTTP client")?;
    let sessions = SessionStore::new();
    let sweeper = sessions.spawn_idle_sweeper(config.session_idle_ttl);
    tracing::info!(ttl = ?config.session_idle_ttl, "🧹 Idle session sweeper started");
    let state = AppState {
        sessions,
        service: Arc::new(StoryService::new(Arc::new(Retrying::new(client, policy)))),
    };

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Starting server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    sweeper.abort();
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}
