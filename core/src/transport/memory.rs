//! In-process relay. Endpoints exchange frames through the same routing rules
//! as the relay server, without a network in between.

use super::{Listeners, SignalingTransport, Subscription, SubscriptionId, Topic};
use crate::error::{Error, Result};
use crate::signaling::{relay, Frame};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Default)]
struct HubInner {
    endpoints: DashMap<String, Weak<MemoryTransport>>,
}

/// Routes frames between [`MemoryTransport`] endpoints by user id.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) the endpoint for `user_id`.
    pub fn endpoint(&self, user_id: &str) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            user_id: user_id.to_string(),
            hub: Arc::downgrade(&self.inner),
            listeners: Listeners::new(),
            online: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });
        self.inner
            .endpoints
            .insert(user_id.to_string(), Arc::downgrade(&transport));
        transport
    }
}

pub struct MemoryTransport {
    user_id: String,
    hub: Weak<HubInner>,
    listeners: Listeners,
    online: AtomicBool,
    sent: Mutex<Vec<Frame>>,
}

impl MemoryTransport {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Simulates the channel going down or coming back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Every frame this endpoint sent, in order.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn deliver(&self, frame: Frame) {
        self.listeners.dispatch(frame);
    }
}

impl SignalingTransport for MemoryTransport {
    fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalingTransport("memory endpoint offline".to_string()));
        }
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| Error::SignalingTransport("memory hub dropped".to_string()))?;

        self.sent.lock().push(frame.clone());

        for delivery in relay(&self.user_id, frame) {
            let target = hub
                .endpoints
                .get(&delivery.recipient)
                .and_then(|weak| weak.upgrade());
            match target {
                Some(endpoint) if endpoint.is_connected() => endpoint.deliver(delivery.frame),
                _ => log::debug!("Dropping frame for offline user {}", delivery.recipient),
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: Topic) -> Subscription {
        self.listeners.subscribe(topic)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.unsubscribe(id);
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
