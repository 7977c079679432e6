//! Typing indicators.
//!
//! The sender emits `typing=true` on every keystroke and a single
//! `typing=false` once input has been idle for a while. The receiver treats a
//! `true` as stale after its own expiry even if the `false` never arrives.

use crate::signaling::{Frame, ThreadEvent, TypingPayload};
use crate::transport::SignalingTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sender side, bound to one thread and peer.
pub struct TypingDebouncer {
    transport: Arc<dyn SignalingTransport>,
    to: String,
    thread_id: String,
    idle: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TypingDebouncer {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        to: &str,
        thread_id: &str,
        idle: Duration,
    ) -> Self {
        Self {
            transport,
            to: to.to_string(),
            thread_id: thread_id.to_string(),
            idle,
            timer: Mutex::new(None),
        }
    }

    /// Emits `typing=true` and re-arms the idle timer.
    pub fn keystroke(&self) {
        send_typing(self.transport.as_ref(), &self.to, &self.thread_id, true);

        let transport = self.transport.clone();
        let to = self.to.clone();
        let thread_id = self.thread_id.clone();
        let idle = self.idle;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            send_typing(transport.as_ref(), &to, &thread_id, false);
        });

        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Cancels a pending idle timer, sending its `typing=false` right away.
    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            if !timer.is_finished() {
                timer.abort();
                send_typing(self.transport.as_ref(), &self.to, &self.thread_id, false);
            }
        }
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

fn send_typing(transport: &dyn SignalingTransport, to: &str, thread_id: &str, typing: bool) {
    let event = ThreadEvent::UserTyping(TypingPayload {
        to: to.to_string(),
        from: None,
        thread_id: thread_id.to_string(),
        typing,
    });
    if let Err(e) = transport.send(Frame::Thread(event)) {
        log::debug!("Typing indicator for {} not sent: {}", thread_id, e);
    }
}

/// Receiver side: who is typing where, with auto-expiry.
pub struct TypingTracker {
    expiry: Duration,
    active: HashMap<(String, String), Instant>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    pub fn on_event(&mut self, thread_id: &str, user_id: &str, typing: bool) {
        let key = (thread_id.to_string(), user_id.to_string());
        if typing {
            self.active.insert(key, Instant::now() + self.expiry);
        } else {
            self.active.remove(&key);
        }
    }

    pub fn is_typing(&self, thread_id: &str, user_id: &str) -> bool {
        self.active
            .get(&(thread_id.to_string(), user_id.to_string()))
            .map_or(false, |deadline| *deadline > Instant::now())
    }

    pub fn typing_users(&self, thread_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut users: Vec<String> = self
            .active
            .iter()
            .filter(|((thread, _), deadline)| thread == thread_id && **deadline > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Drops expired entries and returns them.
    pub fn sweep(&mut self) -> Vec<(String, String)> {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.active.remove(key);
        }
        expired
    }
}
