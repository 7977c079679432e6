//! WebSocket transport with automatic reconnection.

use super::{Listeners, SignalingTransport, Subscription, SubscriptionId, Topic};
use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::{Error, Result};
use crate::signaling::{ControlFrame, Frame};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// The relay refused our credentials. Terminal.
    Rejected,
    Closed,
}

/// Error code the relay sends for a bad or missing token.
const AUTH_FAILED: &str = "AUTH_FAILED";

/// How one connected session ended.
enum SessionEnd {
    Shutdown,
    Dropped,
    Rejected,
}

pub struct WebSocketTransport {
    listeners: Arc<Listeners>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

struct Supervisor {
    url: String,
    auth: String,
    reconnect: ReconnectConfig,
    listeners: Arc<Listeners>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl WebSocketTransport {
    /// Starts connecting in the background and keeps the connection alive
    /// until [`close`](Self::close) is called.
    pub fn connect(config: &ClientConfig, user_id: &str, token: Option<String>) -> Result<Arc<Self>> {
        let auth = Frame::Control(ControlFrame::Authenticate {
            user_id: user_id.to_string(),
            token,
        })
        .to_json()?;

        let listeners = Arc::new(Listeners::new());
        let outbound = Arc::new(Mutex::new(None));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            url: config.ws_url(),
            auth,
            reconnect: config.reconnect.clone(),
            listeners: listeners.clone(),
            outbound: outbound.clone(),
            state: state_tx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(supervisor.run());

        Ok(Arc::new(Self {
            listeners,
            outbound,
            state: state_rx,
            shutdown: shutdown_tx,
        }))
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the socket is connected or `timeout` passes.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let wait = async {
            loop {
                match *state.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => {
                        return Err(Error::SignalingTransport("transport closed".to_string()))
                    }
                    ConnectionState::Rejected => {
                        return Err(Error::SignalingTransport(
                            "relay rejected authentication".to_string(),
                        ))
                    }
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(Error::SignalingTransport("transport closed".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::SignalingTransport("connect timed out".to_string()))?
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.listeners.clear();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl SignalingTransport for WebSocketTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        let text = frame.to_json()?;
        let guard = self.outbound.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::SignalingTransport("not connected".to_string()))?;
        sender
            .send(text)
            .map_err(|e| Error::SignalingTransport(e.to_string()))
    }

    fn subscribe(&self, topic: Topic) -> Subscription {
        self.listeners.subscribe(topic)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => match self.serve(ws_stream).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Rejected => {
                        self.state.send_replace(ConnectionState::Rejected);
                        return;
                    }
                    SessionEnd::Dropped => attempt = 0,
                },
                Err(e) => {
                    log::warn!("WebSocket connect to {} failed: {}", self.url, e);
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.reconnect.delay(attempt);
            self.state.send_replace(ConnectionState::Reconnecting { attempt });
            log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        *self.outbound.lock() = None;
        self.state.send_replace(ConnectionState::Closed);
        log::info!("WebSocket transport closed");
    }

    /// Runs one socket session. Outbound frames are only accepted once the
    /// relay confirmed our identity.
    async fn serve<S>(&mut self, ws_stream: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();

        if let Err(e) = write.send(WsMessage::Text(self.auth.clone())).await {
            log::warn!("WebSocket authentication send failed: {}", e);
            return SessionEnd::Dropped;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match Frame::from_json(&text) {
                        Ok(Frame::Control(ControlFrame::Authenticated { user_id })) => {
                            log::debug!("Relay authenticated {}", user_id);
                            break;
                        }
                        Ok(Frame::Control(ControlFrame::Error { code, message })) => {
                            log::warn!("Relay refused authentication {}: {}", code, message);
                            let _ = write.send(WsMessage::Close(None)).await;
                            if code == AUTH_FAILED {
                                return SessionEnd::Rejected;
                            }
                            return SessionEnd::Dropped;
                        }
                        Ok(frame) => {
                            self.listeners.dispatch(frame);
                        }
                        Err(e) => log::warn!("Dropping unparseable frame: {}", e),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Err(e)) => {
                        log::warn!("WebSocket read failed: {}", e);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
        log::info!("WebSocket connected to {}", self.url);

        let end = loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        log::warn!("WebSocket send failed: {}", e);
                        break SessionEnd::Dropped;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_incoming(&text),
                    Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Dropped,
                    Some(Err(e)) => {
                        log::warn!("WebSocket read failed: {}", e);
                        break SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        *self.outbound.lock() = None;
        end
    }

    fn handle_incoming(&self, text: &str) {
        match Frame::from_json(text) {
            Ok(frame) => {
                if let Frame::Control(ControlFrame::Error { code, message }) = &frame {
                    log::warn!("Relay error {}: {}", code, message);
                }
                self.listeners.dispatch(frame);
            }
            Err(e) => log::warn!("Dropping unparseable frame: {}", e),
        }
    }
}
