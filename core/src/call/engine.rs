//! Call negotiation engine: one call session from creation to teardown.
//!
//! The engine owns the peer connection and local tracks of a single call. It
//! is driven by one task, which feeds it the call's signals and the peer
//! connection's events from [`CallInputs`]. Remote ICE candidates received
//! before the remote description is set are queued and applied in arrival
//! order right after it is set.

use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaDevices, MediaTrack};
use crate::models::{
    CallDirection, CallState, CallType, EndReason, IceCandidate, IceServer, MediaKind,
    SessionDescription,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState, RemoteTrack};
use crate::signaling::{
    AnswerPayload, CallRef, CallSignal, Frame, IceCandidatePayload, OfferPayload,
};
use crate::transport::{SignalingTransport, SubscriptionId, Topic};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Collaborators shared by every call of one client.
#[derive(Clone)]
pub struct CallContext {
    pub user_id: String,
    pub display_name: String,
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub ice_servers: Vec<IceServer>,
}

/// Event sources of one session, owned by whoever drives the engine.
pub struct CallInputs {
    pub signals: mpsc::UnboundedReceiver<Frame>,
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Read-only view of a session for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub call_id: String,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub peer_id: String,
    pub peer_name: String,
    pub state: CallState,
    pub end_reason: Option<EndReason>,
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub remote_tracks: usize,
}

pub struct CallEngine {
    ctx: CallContext,
    call_id: String,
    call_type: CallType,
    direction: CallDirection,
    peer_id: String,
    peer_name: String,
    state: CallState,
    end_reason: Option<EndReason>,

    peer: Option<Box<dyn PeerConnection>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    remote_tracks: Vec<RemoteTrack>,

    /// Offer held while ringing.
    remote_offer: Option<SessionDescription>,
    /// Accepted before the offer arrived; answer as soon as it does.
    answer_on_offer: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    /// Whether the peer already knows about this call.
    peer_aware: bool,

    subscription: Option<SubscriptionId>,
}

impl CallEngine {
    /// Session for a call we place. Starts in `Connecting`; call
    /// [`initiate`](Self::initiate) to acquire media and send the offer.
    pub fn outgoing(
        ctx: CallContext,
        call_id: &str,
        peer_id: &str,
        peer_name: &str,
        call_type: CallType,
    ) -> (Self, CallInputs) {
        let (mut engine, inputs) = Self::new(
            ctx,
            call_id,
            peer_id,
            peer_name,
            call_type,
            CallDirection::Outgoing,
        );
        engine.state = CallState::Connecting;
        (engine, inputs)
    }

    /// Session for a received offer. Starts in `Ringing` holding the offer.
    pub fn incoming(ctx: CallContext, offer: OfferPayload) -> (Self, CallInputs) {
        let (mut engine, inputs) = Self::new(
            ctx,
            &offer.call_id,
            &offer.from,
            &offer.caller_name,
            offer.call_type,
            CallDirection::Incoming,
        );
        engine.state = CallState::Ringing;
        engine.remote_offer = Some(offer.offer);
        engine.peer_aware = true;
        (engine, inputs)
    }

    fn new(
        ctx: CallContext,
        call_id: &str,
        peer_id: &str,
        peer_name: &str,
        call_type: CallType,
        direction: CallDirection,
    ) -> (Self, CallInputs) {
        let subscription = ctx.transport.subscribe(Topic::Call(call_id.to_string()));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let engine = Self {
            ctx,
            call_id: call_id.to_string(),
            call_type,
            direction,
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            state: CallState::Idle,
            end_reason: None,
            peer: None,
            peer_events: peer_tx,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            remote_offer: None,
            answer_on_offer: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            peer_aware: false,
            subscription: Some(subscription.id),
        };
        let inputs = CallInputs {
            signals: subscription.events,
            peer_events: peer_rx,
        };
        (engine, inputs)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn local_tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.local_tracks
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            direction: self.direction,
            peer_id: self.peer_id.clone(),
            peer_name: self.peer_name.clone(),
            state: self.state,
            end_reason: self.end_reason,
            audio_enabled: self.track_enabled(MediaKind::Audio),
            video_enabled: self.track_enabled(MediaKind::Video),
            remote_tracks: self.remote_tracks.len(),
        }
    }

    // ------------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------------

    /// Acquires media, creates the peer connection and sends the offer.
    pub async fn initiate(&mut self) -> Result<()> {
        if self.direction != CallDirection::Outgoing
            || self.state != CallState::Connecting
            || self.peer.is_some()
        {
            return Err(Error::InvalidState(format!(
                "cannot initiate call {} in {:?}",
                self.call_id, self.state
            )));
        }

        match self.send_offer().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_locally(&e).await;
                Err(e)
            }
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        self.prepare_peer().await?;
        let peer = self.peer()?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;

        self.signal(CallSignal::Offer(OfferPayload {
            offer,
            to: self.peer_id.clone(),
            from: self.ctx.user_id.clone(),
            call_id: self.call_id.clone(),
            call_type: self.call_type,
            caller_name: self.ctx.display_name.clone(),
        }))?;
        self.peer_aware = true;
        log::info!("Offer sent for call {} to {}", self.call_id, self.peer_id);
        Ok(())
    }

    /// Callee accepts a ringing call.
    pub async fn accept(&mut self) -> Result<()> {
        if self.direction != CallDirection::Incoming || self.state != CallState::Ringing {
            return Err(Error::InvalidState(format!(
                "cannot accept call {} in {:?}",
                self.call_id, self.state
            )));
        }
        self.state = CallState::Connecting;
        log::info!("Call {} accepted", self.call_id);

        match self.remote_offer.take() {
            Some(offer) => self.answer(offer).await,
            None => {
                self.answer_on_offer = true;
                Ok(())
            }
        }
    }

    /// Handles an offer for this session that arrived after construction.
    pub async fn handle_incoming_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.direction != CallDirection::Incoming || self.remote_description_set {
            log::debug!("Ignoring duplicate offer for call {}", self.call_id);
            return Ok(());
        }
        if self.answer_on_offer {
            self.answer_on_offer = false;
            self.answer(offer).await
        } else {
            self.remote_offer = Some(offer);
            Ok(())
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        match self.send_answer(offer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_locally(&e).await;
                Err(e)
            }
        }
    }

    async fn send_answer(&mut self, offer: SessionDescription) -> Result<()> {
        self.prepare_peer().await?;
        self.apply_remote_description(offer).await?;

        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;

        self.signal(CallSignal::Answer(AnswerPayload {
            answer,
            to: self.peer_id.clone(),
            from: None,
            call_id: self.call_id.clone(),
        }))?;
        log::info!("Answer sent for call {}", self.call_id);
        Ok(())
    }

    pub async fn handle_incoming_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.direction != CallDirection::Outgoing || self.remote_description_set {
            log::debug!("Ignoring unexpected answer for call {}", self.call_id);
            return Ok(());
        }
        if let Err(e) = self.apply_remote_description(answer).await {
            self.fail_locally(&e).await;
            return Err(e);
        }
        log::info!("Answer applied for call {}", self.call_id);
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote description
    /// is set.
    pub async fn handle_incoming_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_description_set {
            log::debug!("Queueing ICE candidate for call {}", self.call_id);
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }
        self.peer()?.add_ice_candidate(candidate).await
    }

    /// Flips the local audio track. `None` when there is no audio track.
    pub fn toggle_audio(&mut self) -> Option<bool> {
        self.toggle(MediaKind::Audio)
    }

    /// Flips the local video track. `None` when there is no video track.
    pub fn toggle_video(&mut self) -> Option<bool> {
        self.toggle(MediaKind::Video)
    }

    fn toggle(&mut self, kind: MediaKind) -> Option<bool> {
        let track = self.local_tracks.iter().find(|t| t.kind() == kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        log::debug!("Call {} {:?} enabled={}", self.call_id, kind, enabled);
        Some(enabled)
    }

    /// Ends the call locally and tells the peer.
    pub async fn hang_up(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let sent = if self.peer_aware {
            self.signal(CallSignal::EndCall(self.call_ref()))
        } else {
            Ok(())
        };
        self.finish(CallState::Ended, EndReason::LocalHangUp).await;
        sent
    }

    /// Declines the call. Before connecting this ends in `Rejected` without
    /// ever creating an answer; afterwards it ends the call.
    pub async fn reject(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let sent = self.signal(CallSignal::RejectCall(self.call_ref()));
        let state = match self.state {
            CallState::Idle | CallState::Ringing => CallState::Rejected,
            _ => CallState::Ended,
        };
        self.finish(state, EndReason::LocalRejected).await;
        sent
    }

    /// Connect timeout expiry. Only affects sessions that never connected.
    pub async fn expire(&mut self) {
        if !self.state.is_pending() {
            return;
        }
        if self.peer_aware {
            if let Err(e) = self.signal(CallSignal::EndCall(self.call_ref())) {
                log::warn!("Could not notify peer of timeout for call {}: {}", self.call_id, e);
            }
        }
        log::info!("Call {} timed out in {:?}", self.call_id, self.state);
        self.finish(CallState::Failed, EndReason::Timeout).await;
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Handles a frame from the call's subscription. Signals for another call
    /// or from anyone but the peer are ignored.
    pub async fn handle_signal(&mut self, frame: Frame) -> Result<()> {
        let signal = match frame {
            Frame::Call(signal) => signal,
            _ => return Ok(()),
        };
        if signal.call_id() != self.call_id {
            log::debug!("Ignoring {} for call {}", signal.name(), signal.call_id());
            return Ok(());
        }
        if self.state.is_terminal() {
            return Ok(());
        }
        if signal.sender() != Some(self.peer_id.as_str()) {
            log::debug!(
                "Ignoring {} for call {} from {:?}",
                signal.name(),
                self.call_id,
                signal.sender()
            );
            return Ok(());
        }

        log::debug!("Call {} received {}", self.call_id, signal.name());
        match signal {
            CallSignal::Offer(p) => self.handle_incoming_offer(p.offer).await,
            CallSignal::Answer(p) => self.handle_incoming_answer(p.answer).await,
            CallSignal::IceCandidate(p) => {
                let result = self.handle_incoming_ice_candidate(p.candidate).await;
                if let Err(e) = &result {
                    log::warn!("Failed to add ICE candidate for call {}: {}", self.call_id, e);
                }
                result
            }
            CallSignal::EndCall(_) | CallSignal::CallEnded(_) => {
                self.finish(CallState::Ended, EndReason::RemoteHangUp).await;
                Ok(())
            }
            CallSignal::RejectCall(_) => {
                self.finish(CallState::Ended, EndReason::RemoteRejected).await;
                Ok(())
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.signal(CallSignal::IceCandidate(IceCandidatePayload {
                    candidate,
                    to: self.peer_id.clone(),
                    from: None,
                    call_id: self.call_id.clone(),
                }))?;
            }
            PeerEvent::StateChanged(PeerState::Connected) => self.mark_connected(),
            PeerEvent::StateChanged(state @ (PeerState::Disconnected | PeerState::Failed)) => {
                if matches!(self.state, CallState::Connecting | CallState::Connected) {
                    log::warn!("Peer connection for call {} went {:?}", self.call_id, state);
                    self.finish(CallState::Failed, EndReason::NegotiationFailed)
                        .await;
                }
            }
            PeerEvent::StateChanged(_) => {}
            PeerEvent::RemoteTrack(track) => {
                log::debug!("Remote {:?} track {} on call {}", track.kind, track.id, self.call_id);
                self.remote_tracks.push(track);
                self.mark_connected();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn prepare_peer(&mut self) -> Result<()> {
        let tracks = self
            .ctx
            .media
            .acquire(MediaConstraints::from(self.call_type))
            .await?;
        self.local_tracks = tracks;

        let peer = self
            .ctx
            .peers
            .create(&self.ctx.ice_servers, self.peer_events.clone())
            .await?;
        self.peer = Some(peer);

        let peer = self.peer()?;
        for track in &self.local_tracks {
            peer.add_track(track.clone()).await?;
        }
        Ok(())
    }

    async fn apply_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        let peer = self
            .peer
            .as_deref()
            .ok_or_else(|| Error::InvalidState(format!("call {} has no peer connection", self.call_id)))?;
        peer.set_remote_description(desc).await?;
        self.remote_description_set = true;

        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                log::warn!("Failed to add queued ICE candidate for call {}: {}", self.call_id, e);
            }
        }
        if queued > 0 {
            log::debug!("Applied {} queued ICE candidates for call {}", queued, self.call_id);
        }
        Ok(())
    }

    fn peer(&self) -> Result<&dyn PeerConnection> {
        self.peer
            .as_deref()
            .ok_or_else(|| Error::InvalidState(format!("call {} has no peer connection", self.call_id)))
    }

    fn mark_connected(&mut self) {
        if self.state == CallState::Connecting {
            self.state = CallState::Connected;
            log::info!("Call {} connected", self.call_id);
        }
    }

    fn track_enabled(&self, kind: MediaKind) -> Option<bool> {
        self.local_tracks
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.is_enabled())
    }

    fn call_ref(&self) -> CallRef {
        CallRef {
            to: self.peer_id.clone(),
            from: None,
            call_id: self.call_id.clone(),
        }
    }

    fn signal(&self, signal: CallSignal) -> Result<()> {
        self.ctx.transport.send(Frame::Call(signal))
    }

    async fn fail_locally(&mut self, error: &Error) {
        let reason = match error {
            Error::MediaAccessDenied(_) => EndReason::MediaAccessDenied,
            Error::SignalingTransport(_) | Error::WebSocket(_) => EndReason::SignalingFailed,
            _ => EndReason::NegotiationFailed,
        };
        if self.peer_aware && reason != EndReason::SignalingFailed {
            if let Err(e) = self.signal(CallSignal::EndCall(self.call_ref())) {
                log::warn!("Could not notify peer of failed call {}: {}", self.call_id, e);
            }
        }
        log::warn!("Call {} failed: {}", self.call_id, error);
        self.finish(CallState::Failed, reason).await;
    }

    async fn finish(&mut self, state: CallState, reason: EndReason) {
        self.state = state;
        self.end_reason = Some(reason);
        log::info!("Call {} {:?} ({:?})", self.call_id, state, reason);
        self.teardown().await;
    }

    /// Releases everything the session holds. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        for track in self.local_tracks.drain(..) {
            track.stop();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                log::warn!("Closing peer connection for call {} failed: {}", self.call_id, e);
            }
        }
        if let Some(id) = self.subscription.take() {
            self.ctx.transport.unsubscribe(id);
        }
        self.pending_candidates.clear();
        self.remote_offer = None;
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        for track in self.local_tracks.drain(..) {
            track.stop();
        }
        if let Some(id) = self.subscription.take() {
            self.ctx.transport.unsubscribe(id);
        }
    }
}
