//! Error types for Hearth Server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Connection already authenticated")]
    AlreadyAuthenticated,

    #[error("Too many connections for {0}")]
    TooManyConnections(String),

    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    BadFrame(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Machine-readable code, shared by HTTP bodies and `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InvalidToken => "AUTH_FAILED",
            AppError::NotAuthenticated => "NOT_AUTHENTICATED",
            AppError::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            AppError::TooManyConnections(_) => "TOO_MANY_CONNECTIONS",
            AppError::FrameTooLarge(_) => "FRAME_TOO_LARGE",
            AppError::BadFrame(_) => "PARSE_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized | AppError::InvalidToken | AppError::NotAuthenticated => {
                StatusCode::UNAUTHORIZED
            }
            AppError::AlreadyAuthenticated | AppError::TooManyConnections(_) => StatusCode::CONFLICT,
            AppError::FrameTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::BadFrame(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message
            }
        }));

        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
