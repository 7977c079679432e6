//! HTTP request handlers for Hearth Server

pub mod health;
pub mod ice;
pub mod presence;
pub mod websocket;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use crate::{crypto, error::AppError, AppState};

/// Caller of a REST endpoint. `user_id` is only known when relay tokens
/// are enabled.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth.shared_secret.as_deref() else {
            return Ok(AuthUser { user_id: None });
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let user_id = crypto::verify_token(token, secret).ok_or(AppError::InvalidToken)?;
        Ok(AuthUser {
            user_id: Some(user_id),
        })
    }
}
