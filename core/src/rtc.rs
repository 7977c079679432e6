//! `webrtc`-crate backed media and peer connections.
//!
//! Local tracks are sample tracks: the platform capture pipeline encodes
//! audio (Opus) and video (VP8) and pushes frames through
//! [`SampleTrack::write_sample`]. Muting keeps the track negotiated but drops
//! frames.

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaDevices, MediaTrack};
use crate::models::{IceCandidate, IceServer, MediaKind, SdpKind, SessionDescription};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState, RemoteTrack};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// Media
// ============================================================================

pub struct SampleTrack {
    id: String,
    kind: MediaKind,
    local: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl SampleTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Arc<Self> {
        let id = format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4());
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Arc::new(Self {
            id,
            kind,
            local,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    pub fn local(&self) -> Arc<TrackLocalStaticSample> {
        self.local.clone()
    }

    /// Sends one encoded frame. Returns false when the frame was dropped
    /// because the track is muted or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.local
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            log::debug!("Stopped local track {}", self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out sample tracks, honouring the user's device permissions.
pub struct RtcMediaDevices {
    allow_microphone: bool,
    allow_camera: bool,
    stream_id: String,
}

impl RtcMediaDevices {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            allow_microphone: config.allow_microphone,
            allow_camera: config.allow_camera,
            stream_id: format!("hearth-{}", uuid::Uuid::new_v4()),
        }
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Vec<Arc<dyn MediaTrack>>> {
        if constraints.audio && !self.allow_microphone {
            return Err(Error::MediaAccessDenied("microphone not allowed".to_string()));
        }
        if constraints.video && !self.allow_camera {
            return Err(Error::MediaAccessDenied("camera not allowed".to_string()));
        }

        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(SampleTrack::new(MediaKind::Audio, &self.stream_id));
        }
        if constraints.video {
            tracks.push(SampleTrack::new(MediaKind::Video, &self.stream_id));
        }
        Ok(tracks)
    }
}

// ============================================================================
// Peer connections
// ============================================================================

pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => log::warn!("Could not serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                log::debug!("Peer connection state {}", state);
                let _ = tx.send(PeerEvent::StateChanged(from_rtc_state(state)));
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => MediaKind::Video,
                    _ => MediaKind::Audio,
                };
                let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id().to_string(),
                    kind,
                }));
            })
        }));

        Ok(Box::new(RtcPeer { pc }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let sample = track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .ok_or_else(|| Error::NegotiationFailure(format!("unsupported track {}", track.id())))?;

        let sender = self
            .pc
            .add_track(sample.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::NegotiationFailure(format!(
            "unexpected description type {}",
            other
        ))),
    }
}

fn from_rtc_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}
