use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod backends;
mod classifier;
mod config;
mod dispatch;
mod enricher;
mod error;
mod model;
mod prompts;
mod session;
mod state;
mod temporal;

pub use config::Config;
pub use error::GatewayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ai_router=info,tower_http=warn".into()),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration from environment")?;
    info!(port = config.port, virtual_model = %config.virtual_model, "ai-router starting");

    let state = state::AppState::new(config)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.port).parse()?;

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::chat::router(std::sync::Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received ctrl-c"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}
