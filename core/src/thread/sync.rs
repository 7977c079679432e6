//! Thread synchronization: sending, receiving and read/typing/reaction
//! updates for the current user's threads.

use super::gate::MessageRequestGate;
use super::list::ThreadList;
use super::typing::{TypingDebouncer, TypingTracker};
use super::voice::VoiceClip;
use crate::api::DataService;
use crate::config::ThreadConfig;
use crate::error::{Error, Result};
use crate::models::{MediaType, Message, MessageThread, OutgoingMessage, UserSummary};
use crate::signaling::{
    Frame, NewMessagePayload, ReactionPayload, ReadPayload, ThreadEvent,
};
use crate::transport::{SignalingTransport, Topic};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A picked photo or video waiting in the compose box.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub data: Bytes,
    pub file_name: String,
    pub mime_type: String,
}

impl Attachment {
    pub fn media_type(&self) -> MediaType {
        MediaType::from_mime(&self.mime_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeBuffer {
    pub text: String,
    pub attachment: Option<Attachment>,
}

struct OpenThread {
    thread_id: String,
    peer_id: String,
    messages: Vec<Message>,
    compose: ComposeBuffer,
    typing: TypingDebouncer,
}

struct SyncState {
    threads: ThreadList,
    open: Option<OpenThread>,
    typing: TypingTracker,
}

pub struct ThreadSync {
    user_id: String,
    data: Arc<dyn DataService>,
    transport: Arc<dyn SignalingTransport>,
    gate: MessageRequestGate,
    typing_idle: Duration,
    state: Mutex<SyncState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadSync {
    pub fn new(
        user_id: &str,
        data: Arc<dyn DataService>,
        transport: Arc<dyn SignalingTransport>,
        config: &ThreadConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            gate: MessageRequestGate::new(user_id, data.clone()),
            data,
            transport,
            typing_idle: config.typing_idle(),
            state: Mutex::new(SyncState {
                threads: ThreadList::new(user_id),
                open: None,
                typing: TypingTracker::new(config.typing_expiry()),
            }),
            listener: Mutex::new(None),
        })
    }

    /// Starts consuming thread events from the transport.
    pub fn listen(self: &Arc<Self>) {
        let mut subscription = self.transport.subscribe(Topic::Threads);
        let this: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(frame) = subscription.events.recv().await {
                let Some(sync) = this.upgrade() else {
                    break;
                };
                if let Frame::Thread(event) = frame {
                    if let Err(e) = sync.handle_event(event).await {
                        log::warn!("Thread event failed: {}", e);
                    }
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Thread list
    // ------------------------------------------------------------------------

    pub async fn refresh_threads(&self) -> Result<()> {
        let threads = self.data.list_threads().await?;
        let mut state = self.state.lock();
        for thread in threads {
            state.threads.upsert(thread);
        }
        Ok(())
    }

    pub fn direct_threads(&self) -> Vec<MessageThread> {
        self.state.lock().threads.direct()
    }

    pub fn pending_requests(&self) -> Vec<MessageThread> {
        self.state.lock().threads.pending()
    }

    pub fn thread(&self, thread_id: &str) -> Option<MessageThread> {
        self.state.lock().threads.get(thread_id).cloned()
    }

    pub async fn start_thread(&self, target: &str) -> Result<MessageThread> {
        let thread = self.gate.start_thread(target).await?;
        self.state.lock().threads.upsert(thread.clone());
        Ok(thread)
    }

    pub async fn accept_request(&self, thread_id: &str) -> Result<bool> {
        self.answer_request(thread_id, true).await
    }

    pub async fn reject_request(&self, thread_id: &str) -> Result<bool> {
        self.answer_request(thread_id, false).await
    }

    async fn answer_request(&self, thread_id: &str, accept: bool) -> Result<bool> {
        let mut thread = self
            .thread(thread_id)
            .ok_or_else(|| Error::NotFound(thread_id.to_string()))?;
        let changed = if accept {
            self.gate.accept(&mut thread).await?
        } else {
            self.gate.reject(&mut thread).await?
        };
        if changed {
            let mut state = self.state.lock();
            if let Some(existing) = state.threads.get_mut(thread_id) {
                existing.is_request = thread.is_request;
                existing.request_state = thread.request_state;
            }
        }
        Ok(changed)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        self.data.search_users(query).await
    }

    // ------------------------------------------------------------------------
    // Open thread
    // ------------------------------------------------------------------------

    /// Loads a thread's messages and marks incoming unread ones as read.
    pub async fn open_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let peer_id = self
            .thread(thread_id)
            .and_then(|t| t.peer_of(&self.user_id).map(str::to_string))
            .ok_or_else(|| Error::NotFound(thread_id.to_string()))?;

        let mut messages = self.data.fetch_messages(thread_id).await?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let unread: Vec<String> = messages
            .iter()
            .filter(|m| m.sender_id != self.user_id && !m.read)
            .map(|m| m.id.clone())
            .collect();

        {
            let mut state = self.state.lock();
            if let Some(previous) = state.open.take() {
                previous.typing.stop();
            }
            state.open = Some(OpenThread {
                thread_id: thread_id.to_string(),
                peer_id: peer_id.clone(),
                messages,
                compose: ComposeBuffer::default(),
                typing: TypingDebouncer::new(
                    self.transport.clone(),
                    &peer_id,
                    thread_id,
                    self.typing_idle,
                ),
            });
            state.threads.clear_unread(thread_id);
        }

        for message_id in unread {
            if let Err(e) = self.mark_read(thread_id, &peer_id, &message_id).await {
                log::warn!("Failed to mark {} read: {}", message_id, e);
            }
        }

        Ok(self.messages())
    }

    pub fn close_thread(&self) {
        if let Some(open) = self.state.lock().open.take() {
            open.typing.stop();
        }
    }

    pub fn open_thread_id(&self) -> Option<String> {
        self.state.lock().open.as_ref().map(|o| o.thread_id.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state
            .lock()
            .open
            .as_ref()
            .map(|o| o.messages.clone())
            .unwrap_or_default()
    }

    pub fn compose(&self) -> ComposeBuffer {
        self.state
            .lock()
            .open
            .as_ref()
            .map(|o| o.compose.clone())
            .unwrap_or_default()
    }

    /// Updates the compose text and signals typing to the peer.
    pub fn set_compose_text(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        let open = open_mut(&mut state)?;
        open.compose.text = text.to_string();
        if !text.is_empty() {
            open.typing.keystroke();
        }
        Ok(())
    }

    pub fn attach(&self, attachment: Attachment) -> Result<()> {
        if attachment.media_type() == MediaType::None {
            return Err(Error::InvalidMessage(format!(
                "unsupported attachment type {}",
                attachment.mime_type
            )));
        }
        open_mut(&mut self.state.lock())?.compose.attachment = Some(attachment);
        Ok(())
    }

    pub fn clear_attachment(&self) -> Result<()> {
        open_mut(&mut self.state.lock())?.compose.attachment = None;
        Ok(())
    }

    pub fn is_peer_typing(&self) -> bool {
        let state = self.state.lock();
        state
            .open
            .as_ref()
            .map_or(false, |o| state.typing.is_typing(&o.thread_id, &o.peer_id))
    }

    pub fn typing_users(&self, thread_id: &str) -> Vec<String> {
        let mut state = self.state.lock();
        state.typing.sweep();
        state.typing.typing_users(thread_id)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Sends the compose buffer to the open thread.
    ///
    /// The text is cleared before any network round trip and is not restored
    /// on failure. An attachment is uploaded first and stays in the buffer if
    /// the upload fails.
    pub async fn send_message(&self) -> Result<Message> {
        let (thread_id, text, attachment) = {
            let mut state = self.state.lock();
            let open = open_mut(&mut state)?;
            if open.compose.text.trim().is_empty() && open.compose.attachment.is_none() {
                return Err(Error::InvalidMessage("message is empty".to_string()));
            }
            open.typing.stop();
            (
                open.thread_id.clone(),
                std::mem::take(&mut open.compose.text),
                open.compose.attachment.clone(),
            )
        };

        let media = match &attachment {
            Some(a) => {
                let url = self
                    .data
                    .upload_media(a.data.clone(), &a.file_name, &a.mime_type)
                    .await
                    .map_err(upload_error)?;
                Some((a.media_type(), url))
            }
            None => None,
        };

        let outgoing = OutgoingMessage::new(&thread_id, &text, media)?;
        let message = self.data.send_message(&outgoing).await?;

        if attachment.is_some() {
            let mut state = self.state.lock();
            if let Some(open) = state.open.as_mut().filter(|o| o.thread_id == thread_id) {
                open.compose.attachment = None;
            }
        }

        self.deliver_sent(message.clone());
        Ok(message)
    }

    /// Uploads a finished voice clip and sends it to the open thread. The
    /// clip is left with the caller if the upload fails.
    pub async fn send_voice(&self, clip: &VoiceClip) -> Result<Message> {
        let thread_id = self
            .open_thread_id()
            .ok_or_else(|| Error::InvalidState("no open thread".to_string()))?;

        let url = self
            .data
            .upload_media(clip.data.clone(), &clip.file_name(), &clip.mime_type)
            .await
            .map_err(upload_error)?;

        let outgoing = OutgoingMessage::new(&thread_id, "", Some((MediaType::Voice, url)))?;
        let message = self.data.send_message(&outgoing).await?;
        self.deliver_sent(message.clone());
        Ok(message)
    }

    /// Appends a message we sent and relays it to the peer.
    fn deliver_sent(&self, message: Message) {
        let (peer_id, is_request) = {
            let mut state = self.state.lock();
            let viewing = is_open(&state, &message.thread_id);
            state.threads.record_message(&message, viewing);
            if let Some(open) = state.open.as_mut().filter(|o| o.thread_id == message.thread_id) {
                insert_ordered(&mut open.messages, message.clone());
            }
            match state.threads.get(&message.thread_id) {
                Some(thread) => (
                    thread.peer_of(&self.user_id).map(str::to_string),
                    thread.is_request,
                ),
                None => (None, false),
            }
        };

        let Some(peer_id) = peer_id else {
            log::warn!("No peer known for thread {}", message.thread_id);
            return;
        };
        let event = ThreadEvent::NewMessage(NewMessagePayload {
            to: peer_id,
            from: None,
            thread_id: message.thread_id.clone(),
            message,
            is_request,
        });
        if let Err(e) = self.transport.send(Frame::Thread(event)) {
            log::warn!("Message stored but not relayed: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------------

    /// Sets our reaction on a message of the open thread, replacing any
    /// previous one.
    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let (thread_id, peer_id) = self.locate(message_id)?;
        self.data.react(message_id, emoji).await?;
        self.update_message(message_id, |m| m.set_reaction(&self.user_id, emoji, Utc::now()));
        self.relay_reaction(thread_id, peer_id, message_id, Some(emoji.to_string()));
        Ok(())
    }

    /// Removes our reaction only.
    pub async fn remove_reaction(&self, message_id: &str) -> Result<()> {
        let (thread_id, peer_id) = self.locate(message_id)?;
        self.data.unreact(message_id).await?;
        self.update_message(message_id, |m| {
            m.clear_reaction(&self.user_id);
        });
        self.relay_reaction(thread_id, peer_id, message_id, None);
        Ok(())
    }

    fn relay_reaction(&self, thread_id: String, peer_id: String, message_id: &str, emoji: Option<String>) {
        let event = ThreadEvent::MessageReaction(ReactionPayload {
            to: peer_id,
            from: None,
            thread_id,
            message_id: message_id.to_string(),
            emoji,
        });
        if let Err(e) = self.transport.send(Frame::Thread(event)) {
            log::warn!("Reaction stored but not relayed: {}", e);
        }
    }

    fn locate(&self, message_id: &str) -> Result<(String, String)> {
        let state = self.state.lock();
        state
            .open
            .as_ref()
            .filter(|o| o.messages.iter().any(|m| m.id == message_id))
            .map(|o| (o.thread_id.clone(), o.peer_id.clone()))
            .ok_or_else(|| Error::NotFound(message_id.to_string()))
    }

    fn update_message(&self, message_id: &str, f: impl FnOnce(&mut Message)) {
        let mut state = self.state.lock();
        if let Some(message) = state
            .open
            .as_mut()
            .and_then(|o| o.messages.iter_mut().find(|m| m.id == message_id))
        {
            f(message);
        }
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    pub async fn handle_event(&self, event: ThreadEvent) -> Result<()> {
        let Some(from) = event.sender().map(str::to_string) else {
            log::debug!("Dropping thread event without sender");
            return Ok(());
        };

        match event {
            ThreadEvent::NewMessage(p) => self.receive_message(&from, p).await,
            ThreadEvent::UserTyping(p) => {
                self.state.lock().typing.on_event(&p.thread_id, &from, p.typing);
                Ok(())
            }
            ThreadEvent::MessageRead(p) => {
                self.update_message(&p.message_id, |m| {
                    m.mark_read(p.read_at);
                });
                Ok(())
            }
            ThreadEvent::MessageReaction(p) => {
                self.update_message(&p.message_id, |m| match &p.emoji {
                    Some(emoji) => m.set_reaction(&from, emoji, Utc::now()),
                    None => {
                        m.clear_reaction(&from);
                    }
                });
                Ok(())
            }
        }
    }

    async fn receive_message(&self, from: &str, payload: NewMessagePayload) -> Result<()> {
        let message = payload.message;
        if message.sender_id != from || message.thread_id != payload.thread_id {
            log::warn!("Dropping message {} with mismatched sender or thread", message.id);
            return Ok(());
        }

        let viewing = {
            let mut state = self.state.lock();
            if state.threads.has_recorded(&message.id) {
                log::debug!("Ignoring redelivered message {}", message.id);
                return Ok(());
            }
            if state.threads.get(&message.thread_id).is_none() {
                state.threads.upsert(MessageThread::new(
                    &message.thread_id,
                    from,
                    &self.user_id,
                    payload.is_request,
                ));
            }
            state.typing.on_event(&message.thread_id, from, false);

            let viewing = is_open(&state, &message.thread_id);
            if let Some(open) = state.open.as_mut().filter(|_| viewing) {
                if open.messages.iter().any(|m| m.id == message.id) {
                    return Ok(());
                }
                insert_ordered(&mut open.messages, message.clone());
            }
            state.threads.record_message(&message, viewing);
            viewing
        };

        if viewing {
            self.mark_read(&message.thread_id, from, &message.id).await?;
        }
        Ok(())
    }

    async fn mark_read(&self, thread_id: &str, peer_id: &str, message_id: &str) -> Result<()> {
        let read_at: DateTime<Utc> = self.data.mark_read(thread_id, message_id).await?;
        self.update_message(message_id, |m| {
            m.mark_read(read_at);
        });

        let event = ThreadEvent::MessageRead(ReadPayload {
            to: peer_id.to_string(),
            from: None,
            thread_id: thread_id.to_string(),
            message_id: message_id.to_string(),
            read_at,
        });
        if let Err(e) = self.transport.send(Frame::Thread(event)) {
            log::debug!("Read receipt for {} not relayed: {}", message_id, e);
        }
        Ok(())
    }
}

impl Drop for ThreadSync {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

fn open_mut(state: &mut SyncState) -> Result<&mut OpenThread> {
    state
        .open
        .as_mut()
        .ok_or_else(|| Error::InvalidState("no open thread".to_string()))
}

fn is_open(state: &SyncState, thread_id: &str) -> bool {
    state.open.as_ref().map_or(false, |o| o.thread_id == thread_id)
}

/// Inserts by creation time; equal timestamps keep arrival order.
fn insert_ordered(messages: &mut Vec<Message>, message: Message) {
    let at = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(at, message);
}

fn upload_error(e: Error) -> Error {
    match e {
        Error::UploadFailure(_) => e,
        other => Error::UploadFailure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relationship;
    use crate::test_support::{message, FakeData};
    use crate::transport::{MemoryHub, MemoryTransport};
    use std::sync::atomic::Ordering;

    fn config() -> ThreadConfig {
        ThreadConfig {
            typing_idle_ms: 2_000,
            typing_expiry_ms: 3_000,
        }
    }

    struct Side {
        data: Arc<FakeData>,
        transport: Arc<MemoryTransport>,
        sync: Arc<ThreadSync>,
    }

    fn side(hub: &MemoryHub, user_id: &str) -> Side {
        let data = Arc::new(FakeData::new(user_id));
        let transport = hub.endpoint(user_id);
        let sync = ThreadSync::new(user_id, data.clone(), transport.clone(), &config());
        Side {
            data,
            transport,
            sync,
        }
    }

    fn sent_events(transport: &MemoryTransport) -> Vec<ThreadEvent> {
        transport
            .sent()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Thread(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    async fn opened(side: &Side, thread: MessageThread) {
        side.data.insert_thread(thread.clone());
        side.sync.refresh_threads().await.unwrap();
        side.sync.open_thread(&thread.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_clears_text_and_relays() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;

        alice.sync.set_compose_text("hello bob").unwrap();
        let sent = alice.sync.send_message().await.unwrap();

        assert_eq!(sent.text, "hello bob");
        assert_eq!(alice.sync.compose().text, "");
        assert_eq!(alice.sync.messages(), vec![sent.clone()]);
        assert_eq!(
            alice.sync.thread("t1").unwrap().last_message.as_deref(),
            Some("hello bob")
        );
        assert!(sent_events(&alice.transport).iter().any(|e| matches!(
            e,
            ThreadEvent::NewMessage(p) if p.to == "bob" && p.message.id == sent.id
        )));
    }

    #[tokio::test]
    async fn test_failed_send_does_not_restore_text() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;
        alice.data.fail_sends.store(true, Ordering::SeqCst);

        alice.sync.set_compose_text("lost").unwrap();
        assert!(alice.sync.send_message().await.is_err());
        assert_eq!(alice.sync.compose().text, "");
        assert!(alice.sync.messages().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_attachment() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;
        alice.data.fail_uploads.store(true, Ordering::SeqCst);

        let photo = Attachment {
            data: Bytes::from_static(b"\x89PNG"),
            file_name: "cat.png".into(),
            mime_type: "image/png".into(),
        };
        alice.sync.attach(photo.clone()).unwrap();
        let err = alice.sync.send_message().await.unwrap_err();
        assert!(matches!(err, Error::UploadFailure(_)));
        assert_eq!(alice.sync.compose().attachment, Some(photo));

        alice.data.fail_uploads.store(false, Ordering::SeqCst);
        let sent = alice.sync.send_message().await.unwrap();
        assert_eq!(sent.text, "📷 Photo");
        assert_eq!(sent.media_type, MediaType::Image);
        assert!(alice.sync.compose().attachment.is_none());
    }

    #[tokio::test]
    async fn test_received_message_in_open_thread_is_read() {
        let hub = MemoryHub::new();
        let bob = side(&hub, "bob");
        let alice = hub.endpoint("alice");
        let mut alice_threads = alice.subscribe(Topic::Threads);
        opened(&bob, MessageThread::new("t1", "alice", "bob", false)).await;

        let msg = message("m9", "t1", "alice", "hi", Utc::now());
        bob.sync
            .handle_event(ThreadEvent::NewMessage(NewMessagePayload {
                to: "bob".into(),
                from: Some("alice".into()),
                thread_id: "t1".into(),
                message: msg,
                is_request: false,
            }))
            .await
            .unwrap();

        let messages = bob.sync.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].read);
        assert_eq!(bob.data.read_ids(), vec!["m9".to_string()]);
        match alice_threads.events.try_recv() {
            Ok(Frame::Thread(ThreadEvent::MessageRead(p))) => assert_eq!(p.message_id, "m9"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_for_closed_thread_counts_unread() {
        let hub = MemoryHub::new();
        let bob = side(&hub, "bob");
        bob.data.insert_thread(MessageThread::new("t1", "alice", "bob", false));
        bob.sync.refresh_threads().await.unwrap();

        let ping = message("m1", "t1", "alice", "ping", Utc::now());
        // The relay may deliver the same message twice across a reconnect.
        for _ in 0..2 {
            bob.sync
                .handle_event(ThreadEvent::NewMessage(NewMessagePayload {
                    to: "bob".into(),
                    from: Some("alice".into()),
                    thread_id: "t1".into(),
                    message: ping.clone(),
                    is_request: false,
                }))
                .await
                .unwrap();
        }

        let thread = bob.sync.thread("t1").unwrap();
        assert_eq!(thread.unread_count, 1);
        assert_eq!(thread.last_message.as_deref(), Some("ping"));
        assert!(bob.data.read_ids().is_empty());
    }

    #[tokio::test]
    async fn test_new_request_lands_in_pending() {
        let hub = MemoryHub::new();
        let bob = side(&hub, "bob");

        bob.sync
            .handle_event(ThreadEvent::NewMessage(NewMessagePayload {
                to: "bob".into(),
                from: Some("carol".into()),
                thread_id: "t7".into(),
                message: message("m1", "t7", "carol", "hey there", Utc::now()),
                is_request: true,
            }))
            .await
            .unwrap();

        let pending = bob.sync.pending_requests();
        assert_eq!(pending.len(), 1);
        assert!(bob.sync.direct_threads().is_empty());
    }

    #[tokio::test]
    async fn test_ordering_by_timestamp_then_arrival() {
        let hub = MemoryHub::new();
        let bob = side(&hub, "bob");
        opened(&bob, MessageThread::new("t1", "alice", "bob", false)).await;

        let t0 = Utc::now();
        for (id, at) in [("late", t0 + chrono::Duration::seconds(5)), ("a", t0), ("b", t0)] {
            bob.sync
                .handle_event(ThreadEvent::NewMessage(NewMessagePayload {
                    to: "bob".into(),
                    from: Some("alice".into()),
                    thread_id: "t1".into(),
                    message: message(id, "t1", "alice", id, at),
                    is_request: false,
                }))
                .await
                .unwrap();
        }

        let ids: Vec<String> = bob.sync.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b", "late"]);
    }

    #[tokio::test]
    async fn test_reactions_are_last_write_wins_per_user() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        alice.data.insert_message(message("m1", "t1", "bob", "nice", Utc::now()));
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;

        alice.sync.add_reaction("m1", "❤️").await.unwrap();
        alice.sync.add_reaction("m1", "🔥").await.unwrap();
        alice
            .sync
            .handle_event(ThreadEvent::MessageReaction(ReactionPayload {
                to: "alice".into(),
                from: Some("bob".into()),
                thread_id: "t1".into(),
                message_id: "m1".into(),
                emoji: Some("😂".into()),
            }))
            .await
            .unwrap();

        let msg = alice.sync.messages().remove(0);
        assert_eq!(msg.reactions.len(), 2);
        assert_eq!(msg.reactions["alice"].emoji, "🔥");
        assert_eq!(alice.data.reaction("m1").as_deref(), Some("🔥"));

        alice.sync.remove_reaction("m1").await.unwrap();
        let msg = alice.sync.messages().remove(0);
        assert_eq!(msg.reactions.len(), 1);
        assert!(msg.reactions.contains_key("bob"));
    }

    #[tokio::test]
    async fn test_voice_clip_sent_as_voice_message() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;

        let clip = VoiceClip {
            data: Bytes::from_static(b"opus"),
            mime_type: "audio/ogg".into(),
            duration: Duration::from_secs(3),
        };
        let sent = alice.sync.send_voice(&clip).await.unwrap();
        assert_eq!(sent.media_type, MediaType::Voice);
        assert_eq!(sent.text, "🎤 Voice message");
        assert_eq!(alice.data.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_user_cannot_be_messaged() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        alice.data.set_relationship(
            "eve",
            Relationship {
                blocked: true,
                ..Default::default()
            },
        );
        assert!(matches!(
            alice.sync.start_thread("eve").await,
            Err(Error::RequestPolicyDenied(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_typing_expires() {
        let hub = MemoryHub::new();
        let bob = side(&hub, "bob");
        opened(&bob, MessageThread::new("t1", "alice", "bob", false)).await;

        bob.sync
            .handle_event(ThreadEvent::UserTyping(crate::signaling::TypingPayload {
                to: "bob".into(),
                from: Some("alice".into()),
                thread_id: "t1".into(),
                typing: true,
            }))
            .await
            .unwrap();
        assert!(bob.sync.is_peer_typing());

        tokio::time::advance(Duration::from_millis(3_100)).await;
        assert!(!bob.sync.is_peer_typing());
        assert!(bob.sync.typing_users("t1").is_empty());
    }

    #[tokio::test]
    async fn test_listen_applies_relayed_events() {
        let hub = MemoryHub::new();
        let alice = side(&hub, "alice");
        let bob = side(&hub, "bob");
        opened(&alice, MessageThread::new("t1", "alice", "bob", false)).await;
        bob.data.insert_thread(MessageThread::new("t1", "alice", "bob", false));
        bob.sync.refresh_threads().await.unwrap();
        bob.sync.listen();

        alice.sync.set_compose_text("over the wire").unwrap();
        alice.sync.send_message().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while bob.sync.thread("t1").unwrap().unread_count == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            bob.sync.thread("t1").unwrap().last_message.as_deref(),
            Some("over the wire")
        );
    }
}
