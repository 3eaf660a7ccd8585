//! Huddle Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod engine;
pub mod error;
pub mod session;
pub mod state;
pub mod ws;

use engine::{EngineHealth, RoutingEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Create and configure the server application
pub fn create_app(
    config: state::Config,
    engine: Arc<dyn RoutingEngine>,
) -> (axum::Router, state::AppState) {
    let app_state = state::AppState::new(config, engine);
    let router = api::create_router(app_state.clone());
    (router, app_state)
}

/// Resolves once the engine has died and `grace` has elapsed, with the
/// reason it gave. Never resolves while the engine stays alive.
pub async fn engine_died(mut health: watch::Receiver<EngineHealth>, grace: Duration) -> String {
    let reason = loop {
        if let EngineHealth::Died(reason) = &*health.borrow_and_update() {
            break reason.clone();
        }
        if health.changed().await.is_err() {
            return std::future::pending().await;
        }
    };

    tracing::error!(
        "Media engine died ({}), shutting down in {:?}",
        reason,
        grace
    );
    tokio::time::sleep(grace).await;
    reason
}
