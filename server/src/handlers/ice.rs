//! ICE server list for WebRTC

use axum::{extract::State, Json};
use hearth_core::models::IceServer;

use crate::{crypto, error::Result, AppState};

use super::AuthUser;

/// Configured STUN servers, plus a TURN entry with fresh time-limited
/// credentials when TURN is configured.
pub async fn get_ice_servers(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<IceServer>>> {
    let mut servers = state.config.ice.servers.clone();

    if let Some(turn) = &state.config.ice.turn {
        let (username, credential) =
            crypto::generate_turn_credentials(&turn.username, &turn.secret, turn.ttl_seconds);
        servers.push(IceServer {
            urls: turn.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        });
    }

    Ok(Json(servers))
}
