//! Presence lookup

use axum::{
    extract::{Path, State},
    Json,
};

use crate::{error::Result, models::PresenceResponse, AppState};

use super::AuthUser;

pub async fn get_presence(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>> {
    let connections = state.connections.connection_count(&user_id);
    Ok(Json(PresenceResponse {
        user_id,
        online: connections > 0,
        connections,
    }))
}
