//! WebSocket relay for signaling and thread events

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use hearth_core::signaling::{self, ControlFrame, Frame};
use tokio::sync::mpsc;

use crate::{
    crypto,
    error::{AppError, Result},
    AppState,
};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.to_json() {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to encode frame: {}", e),
            }
        }
    });

    let mut conn = RelayConnection {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: None,
        tx,
        state,
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = conn.handle_text(&text) {
                    tracing::debug!("Rejected frame on {}: {}", conn.id, e);
                    conn.send_error(&e);
                }
            }
            Ok(Message::Binary(_)) => {
                conn.send_error(&AppError::BadFrame("binary frames are not supported".to_string()));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    conn.close();
    send_task.abort();
}

/// One client socket, authenticated at most once.
struct RelayConnection {
    id: String,
    user_id: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
    state: AppState,
}

impl RelayConnection {
    fn handle_text(&mut self, text: &str) -> Result<()> {
        let limit = self.state.config.max_frame_bytes();
        if text.len() > limit {
            return Err(AppError::FrameTooLarge(limit));
        }

        let frame = Frame::from_json(text).map_err(|e| AppError::BadFrame(e.to_string()))?;
        match frame {
            Frame::Control(ControlFrame::Authenticate { user_id, token }) => {
                self.authenticate(user_id, token)
            }
            Frame::Control(ControlFrame::Ping) => {
                self.send(Frame::Control(ControlFrame::Pong));
                Ok(())
            }
            Frame::Control(ControlFrame::Pong) => Ok(()),
            Frame::Control(_) => Err(AppError::BadFrame("unexpected control frame".to_string())),
            frame => self.relay(frame),
        }
    }

    fn authenticate(&mut self, user_id: String, token: Option<String>) -> Result<()> {
        if self.user_id.is_some() {
            return Err(AppError::AlreadyAuthenticated);
        }
        if user_id.is_empty() {
            return Err(AppError::BadFrame("empty user id".to_string()));
        }

        if let Some(secret) = self.state.config.auth.shared_secret.as_deref() {
            let verified = token
                .as_deref()
                .and_then(|t| crypto::verify_token(t, secret));
            if verified.as_deref() != Some(user_id.as_str()) {
                return Err(AppError::InvalidToken);
            }
        }

        self.state
            .connections
            .register(&user_id, &self.id, self.tx.clone())?;
        tracing::info!("WebSocket authenticated: user={}, connection={}", user_id, self.id);

        self.user_id = Some(user_id.clone());
        self.send(Frame::Control(ControlFrame::Authenticated { user_id }));
        Ok(())
    }

    fn relay(&self, frame: Frame) -> Result<()> {
        let sender = self.user_id.as_deref().ok_or(AppError::NotAuthenticated)?;

        let deliveries = signaling::relay(sender, frame);
        let Some(first) = deliveries.first() else {
            return Err(AppError::BadFrame("frame has no recipient".to_string()));
        };
        if !self.state.connections.is_user_online(&first.recipient) {
            tracing::debug!("Recipient {} is offline, dropping frame from {}", first.recipient, sender);
        }

        self.state.connections.deliver(deliveries);
        Ok(())
    }

    fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    fn send_error(&self, error: &AppError) {
        self.send(Frame::Control(ControlFrame::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }));
    }

    fn close(&self) {
        self.state.connections.unregister(&self.id);
    }
}
