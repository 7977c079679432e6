//! Peer connection abstraction used by the call engine.

use crate::error::Result;
use crate::media::MediaTrack;
use crate::models::{IceCandidate, IceServer, MediaKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    /// First media from the peer on a new track.
    RemoteTrack(RemoteTrack),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Rejected by implementations while no remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates one connection per call, bound to the given ICE servers. Events
/// for that connection are sent on `events`.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>>;
}
