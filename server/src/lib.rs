//! Hearth Server - signaling relay for Hearth calls and chat
//!
//! This server handles:
//! - Connection authentication (optionally with HMAC relay tokens)
//! - Routing call signals and thread events to the addressed user
//! - ICE server discovery with time-limited TURN credentials
//! - Presence lookups

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod models;
pub mod websocket;

use std::sync::Arc;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(ConnectionManager::new(config.limits.max_connections_per_user));
        Self {
            config: Arc::new(config),
            connections,
        }
    }
}

/// Build the HTTP and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ws", get(handlers::websocket::websocket_handler))
        .route("/api/v1/ice-servers", get(handlers::ice::get_ice_servers))
        .route("/api/v1/presence/:user_id", get(handlers::presence::get_presence))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}
