//! HTTP response bodies for Hearth Server

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: String,
    pub online: bool,
    pub connections: usize,
}
