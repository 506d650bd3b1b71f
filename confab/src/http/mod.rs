//! HTTP surface: liveness, management statistics and WebSocket signaling

pub mod error;
pub mod health;
pub mod identity;
pub mod stats;
pub mod websocket;

use axum::{routing::get, Router};
use confab_sfu::SfuServer;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::SignalingConfig;

pub use error::{AppError, AppResult};
pub use identity::TrustedUser;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<SfuServer>,
    pub signaling: SignalingConfig,
}

/// Build the full router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .merge(stats::create_stats_router())
        .route("/ws", get(websocket::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
