//! Error types for Hearth Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Camera or microphone access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Signaling transport unavailable: {0}")]
    SignalingTransport(String),

    #[error("Call negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("Cannot message {0}: request threading is not allowed")]
    RequestPolicyDenied(String),

    #[error("Upload failed: {0}")]
    UploadFailure(String),

    #[error("Another call is already in progress")]
    CallInProgress,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error should be surfaced to the user rather than only
    /// logged.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Error::InvalidState(_) | Error::Json(_) | Error::Io(_) | Error::Config(_)
        )
    }

    /// Short text for a user-facing notification.
    pub fn toast(&self) -> String {
        match self {
            Error::MediaAccessDenied(_) => {
                "Allow camera and microphone access to place calls".to_string()
            }
            Error::SignalingTransport(_) | Error::WebSocket(_) => {
                "Connection lost. Please try again".to_string()
            }
            Error::NegotiationFailure(_) => "Call failed".to_string(),
            Error::RequestPolicyDenied(_) => "You can't message this user".to_string(),
            Error::UploadFailure(_) => "Upload failed. Your attachment was kept".to_string(),
            Error::CallInProgress => "You are already in a call".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

#[cfg(feature = "webrtc")]
impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::NegotiationFailure(e.to_string())
    }
}
