#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use coflight::Registry;
use coflight_axum::CoalesceLayer;
use server::config::{CliArgs, ServerConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let coalesce = CoalesceLayer::new(config.coalesce.clone());
    let registry = Arc::clone(coalesce.registry());

    let app = server::routes::router().layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(coalesce),
    );

    let listener = TcpListener::bind(&config.listen_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    tracing::info!(
        addr = %config.listen_addr,
        ttl_ms = config.coalesce.ttl.as_millis() as u64,
        methods = ?config.coalesce.dedupe_methods,
        "starting coalescing demo server",
    );
}

async fn shutdown_signal(registry: Arc<Registry>) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!(
        inflight = registry.inflight(),
        "shutdown signal received, draining connections",
    );
}
