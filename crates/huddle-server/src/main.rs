use anyhow::Result;
use huddle_server::engine::loopback::LoopbackEngine;
use huddle_server::engine::RoutingEngine;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Huddle signaling server...");

    // Load configuration
    let config = huddle_server::state::Config::load()?;

    // Start the media engine
    let engine = Arc::new(LoopbackEngine::new(config.worker_settings()));
    let health = engine.health();

    // Build the router
    let (app, _state) = huddle_server::create_app(config.clone(), engine);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    let (died_tx, mut died_rx) = oneshot::channel();
    let grace = config.engine_death_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                reason = huddle_server::engine_died(health, grace) => {
                    let _ = died_tx.send(reason);
                }
            }
        })
        .await?;

    if let Ok(reason) = died_rx.try_recv() {
        anyhow::bail!("media engine died: {}", reason);
    }

    tracing::info!("Huddle server shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => tracing::error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                tracing::info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
