//! Hearth Core Library
//!
//! Real-time layer of the Hearth client: one-to-one audio/video call
//! signaling and message thread synchronization over a persistent
//! signaling connection.
//! Provides: wire frames, transports, call sessions, and threads.

pub mod api;
pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod models;
pub mod peer;
pub mod signaling;
pub mod thread;
pub mod transport;

#[cfg(feature = "webrtc")]
pub mod rtc;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use api::{ApiClient, DataService};
pub use call::{CallController, CallContext, CallEngine, CallSnapshot};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use media::{MediaConstraints, MediaDevices, MediaTrack};
pub use models::*;
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
pub use signaling::{CallSignal, ControlFrame, Frame, ThreadEvent};
pub use thread::{Attachment, ThreadSync, VoiceClip, VoiceRecorder};
pub use transport::{SignalingTransport, Topic, WebSocketTransport};

/// Who the client is signed in as.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub display_name: String,
    pub token: Option<String>,
}

/// Main client instance
pub struct HearthClient {
    session: Session,
    api: Arc<ApiClient>,
    transport: Arc<WebSocketTransport>,
    calls: Arc<CallController>,
    threads: Arc<ThreadSync>,
}

impl HearthClient {
    /// Connect with the given media and peer connection backends.
    pub async fn connect(
        config: ClientConfig,
        session: Session,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let api = Arc::new(ApiClient::new(&config)?);
        api.set_token(session.token.clone());

        let ice_servers = match api.ice_servers().await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => config.calls.ice_servers.clone(),
            Err(e) => {
                log::warn!("Using configured ICE servers: {}", e);
                config.calls.ice_servers.clone()
            }
        };

        let transport = WebSocketTransport::connect(&config, &session.user_id, session.token.clone())?;
        let data: Arc<dyn DataService> = api.clone();

        let ctx = CallContext {
            user_id: session.user_id.clone(),
            display_name: session.display_name.clone(),
            transport: transport.clone(),
            media,
            peers,
            ice_servers,
        };
        let calls = CallController::new(ctx, data.clone(), config.connect_timeout());
        calls.listen();

        let threads = ThreadSync::new(&session.user_id, data, transport.clone(), &config.threads);
        threads.listen();

        log::info!("Hearth client started for {}", session.user_id);

        Ok(Self {
            session,
            api,
            transport,
            calls,
            threads,
        })
    }

    /// Connect using the bundled `webrtc` media and peer backends.
    #[cfg(feature = "webrtc")]
    pub async fn connect_webrtc(config: ClientConfig, session: Session) -> Result<Self> {
        let media = Arc::new(rtc::RtcMediaDevices::new(&config.calls));
        let peers = Arc::new(rtc::RtcPeerFactory::new()?);
        Self::connect(config, session, media, peers).await
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn calls(&self) -> &Arc<CallController> {
        &self.calls
    }

    pub fn threads(&self) -> &Arc<ThreadSync> {
        &self.threads
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Ends any active call and closes the signaling connection.
    pub async fn shutdown(&self) {
        if self.calls.is_busy() {
            if let Err(e) = self.calls.hang_up().await {
                log::debug!("Hang up on shutdown: {}", e);
            }
        }
        self.transport.close();
    }
}
