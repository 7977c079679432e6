//! In-crate fakes for media, peer connections and the data service.

use crate::api::DataService;
use crate::error::{Error, Result};
use crate::media::{MediaConstraints, MediaDevices, MediaTrack};
use crate::models::*;
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Media
// ============================================================================

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack for FakeTrack {
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
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub deny: AtomicBool,
    /// Never answers, like a permission prompt left open.
    pub stall: AtomicBool,
    acquired: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMedia {
    pub fn denying() -> Self {
        let media = Self::default();
        media.deny.store(true, Ordering::SeqCst);
        media
    }

    /// Every track ever handed out.
    pub fn acquired(&self) -> Vec<Arc<FakeTrack>> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Vec<Arc<dyn MediaTrack>>> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::MediaAccessDenied("permission dismissed".to_string()));
        }
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(MediaKind::Audio);
        }
        if constraints.video {
            kinds.push(MediaKind::Video);
        }

        let mut acquired = self.acquired.lock();
        Ok(kinds
            .into_iter()
            .map(|kind| {
                let track = Arc::new(FakeTrack {
                    id: format!("{:?}-{}", kind, acquired.len()),
                    kind,
                    enabled: AtomicBool::new(true),
                    live: AtomicBool::new(true),
                });
                acquired.push(track.clone());
                track as Arc<dyn MediaTrack>
            })
            .collect())
    }
}

// ============================================================================
// Peer connections
// ============================================================================

#[derive(Debug, Default)]
pub struct PeerLog {
    pub tracks: usize,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub answers_created: usize,
    pub closed: bool,
}

/// Test-side view of one fake connection.
#[derive(Clone)]
pub struct FakePeerHandle {
    pub log: Arc<Mutex<PeerLog>>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub ice_servers: Vec<IceServer>,
}

impl FakePeerHandle {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied(&self) -> Vec<String> {
        self.log
            .lock()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }
}

struct FakePeer {
    log: Arc<Mutex<PeerLog>>,
    fail_tracks: bool,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<()> {
        if self.fail_tracks {
            return Err(Error::NegotiationFailure("codec unsupported".to_string()));
        }
        self.log.lock().tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut log = self.log.lock();
        if log.remote.is_none() {
            return Err(Error::NegotiationFailure("no remote offer".to_string()));
        }
        log.answers_created += 1;
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut log = self.log.lock();
        if log.remote.is_none() {
            return Err(Error::NegotiationFailure("remote description not set".to_string()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<FakePeerHandle>>,
    pub fail_tracks: AtomicBool,
}

impl FakePeerFactory {
    pub fn created(&self) -> Vec<FakePeerHandle> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> FakePeerHandle {
        self.created.lock().last().cloned().expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>> {
        let log = Arc::new(Mutex::new(PeerLog::default()));
        self.created.lock().push(FakePeerHandle {
            log: log.clone(),
            events,
            ice_servers: ice_servers.to_vec(),
        });
        Ok(Box::new(FakePeer {
            log,
            fail_tracks: self.fail_tracks.load(Ordering::SeqCst),
        }))
    }
}

// ============================================================================
// Data service
// ============================================================================

#[derive(Default)]
struct FakeStore {
    threads: HashMap<String, MessageThread>,
    messages: HashMap<String, Vec<Message>>,
    relationships: HashMap<String, Relationship>,
    reactions: HashMap<String, String>,
    read: Vec<String>,
    uploads: Vec<(String, usize)>,
}

/// In-memory data service acting for `user_id`.
pub struct FakeData {
    user_id: String,
    store: Mutex<FakeStore>,
    next_id: AtomicU64,
    pub fail_uploads: AtomicBool,
    pub fail_sends: AtomicBool,
}

impl FakeData {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            store: Mutex::new(FakeStore::default()),
            next_id: AtomicU64::new(1),
            fail_uploads: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn set_relationship(&self, user_id: &str, relationship: Relationship) {
        self.store
            .lock()
            .relationships
            .insert(user_id.to_string(), relationship);
    }

    pub fn insert_thread(&self, thread: MessageThread) {
        self.store.lock().threads.insert(thread.id.clone(), thread);
    }

    pub fn insert_message(&self, message: Message) {
        self.store
            .lock()
            .messages
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
    }

    pub fn thread(&self, id: &str) -> Option<MessageThread> {
        self.store.lock().threads.get(id).cloned()
    }

    pub fn read_ids(&self) -> Vec<String> {
        self.store.lock().read.clone()
    }

    pub fn reaction(&self, message_id: &str) -> Option<String> {
        self.store.lock().reactions.get(message_id).cloned()
    }

    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.store.lock().uploads.clone()
    }
}

pub fn message(id: &str, thread_id: &str, sender_id: &str, text: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        sender_id: sender_id.to_string(),
        text: text.to_string(),
        media_type: MediaType::None,
        media_url: None,
        created_at: at,
        read: false,
        read_at: None,
        reactions: BTreeMap::new(),
    }
}

#[async_trait]
impl DataService for FakeData {
    async fn create_call_record(&self, callee_id: &str, call_type: CallType) -> Result<CallRecord> {
        Ok(CallRecord {
            call_id: self.next_id("call-"),
            caller_id: self.user_id.clone(),
            callee_id: callee_id.to_string(),
            call_type,
            created_at: Utc::now(),
        })
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Message> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Http("503 Service Unavailable".to_string()));
        }
        let msg = Message {
            id: self.next_id("m"),
            thread_id: outgoing.thread_id.clone(),
            sender_id: self.user_id.clone(),
            text: outgoing.text.clone(),
            media_type: outgoing.media_type,
            media_url: outgoing.media_url.clone(),
            created_at: Utc::now(),
            read: false,
            read_at: None,
            reactions: BTreeMap::new(),
        };
        self.insert_message(msg.clone());
        Ok(msg)
    }

    async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .store
            .lock()
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_threads(&self) -> Result<Vec<MessageThread>> {
        Ok(self.store.lock().threads.values().cloned().collect())
    }

    async fn mark_read(&self, _thread_id: &str, message_id: &str) -> Result<DateTime<Utc>> {
        self.store.lock().read.push(message_id.to_string());
        Ok(Utc::now())
    }

    async fn react(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.store
            .lock()
            .reactions
            .insert(message_id.to_string(), emoji.to_string());
        Ok(())
    }

    async fn unreact(&self, message_id: &str) -> Result<()> {
        self.store.lock().reactions.remove(message_id);
        Ok(())
    }

    async fn relationship(&self, user_id: &str) -> Result<Relationship> {
        Ok(self
            .store
            .lock()
            .relationships
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn create_thread(&self, peer_id: &str, is_request: bool) -> Result<MessageThread> {
        let thread = MessageThread::new(&self.next_id("t"), &self.user_id, peer_id, is_request);
        self.insert_thread(thread.clone());
        Ok(thread)
    }

    async fn accept_request(&self, thread_id: &str) -> Result<()> {
        let mut store = self.store.lock();
        let thread = store
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| Error::NotFound(thread_id.to_string()))?;
        thread.is_request = false;
        thread.request_state = RequestState::Accepted;
        Ok(())
    }

    async fn reject_request(&self, thread_id: &str) -> Result<()> {
        let mut store = self.store.lock();
        let thread = store
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| Error::NotFound(thread_id.to_string()))?;
        thread.request_state = RequestState::Rejected;
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        Ok(self
            .store
            .lock()
            .relationships
            .keys()
            .filter(|id| id.contains(query))
            .map(|id| UserSummary {
                user_id: id.clone(),
                display_name: None,
                avatar_url: None,
            })
            .collect())
    }

    async fn upload_media(&self, data: Bytes, file_name: &str, _mime_type: &str) -> Result<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::UploadFailure("storage unavailable".to_string()));
        }
        self.store
            .lock()
            .uploads
            .push((file_name.to_string(), data.len()));
        Ok(format!("https://cdn.test/{}", file_name))
    }
}
