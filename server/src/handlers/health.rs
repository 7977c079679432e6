//! Health check handler

use axum::{extract::State, Json};

use crate::{models::HealthResponse, AppState};

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online_users: state.connections.online_user_count(),
    })
}
