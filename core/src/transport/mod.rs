//! Signaling transport: the event channel between a client and the relay.
//!
//! Consumers subscribe to a [`Topic`] and receive matching frames on an
//! unbounded channel in arrival order. Call signals that arrive for a call
//! nobody listens to yet are held for a short while and handed to the first
//! subscriber of that call, so candidates that race ahead of session setup are
//! not lost.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryHub, MemoryTransport};
pub use websocket::{ConnectionState, WebSocketTransport};

use crate::error::Result;
use crate::signaling::{CallSignal, Frame};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const HELD_SIGNAL_LIMIT: usize = 256;
const HELD_SIGNAL_TTL: Duration = Duration::from_secs(30);

/// Bidirectional signaling channel shared by the call and chat subsystems.
pub trait SignalingTransport: Send + Sync {
    /// Queues a frame for delivery. Fails with `SignalingTransport` when the
    /// channel is down; nothing is retried.
    fn send(&self, frame: Frame) -> Result<()>;

    fn subscribe(&self, topic: Topic) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// `webrtc-offer` frames that open a new call.
    IncomingCalls,
    /// Every other signal carrying this call id.
    Call(String),
    /// All thread sync events.
    Threads,
    /// Connection control frames from the relay.
    Control,
}

impl Topic {
    fn matches(&self, frame: &Frame) -> bool {
        match (self, frame) {
            (Topic::IncomingCalls, Frame::Call(CallSignal::Offer(_))) => true,
            (Topic::Call(_), Frame::Call(CallSignal::Offer(_))) => false,
            (Topic::Call(id), Frame::Call(signal)) => signal.call_id() == id,
            (Topic::Threads, Frame::Thread(_)) => true,
            (Topic::Control, Frame::Control(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<Frame>,
}

struct Listener {
    id: SubscriptionId,
    topic: Topic,
    sender: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct ListenerState {
    next_id: u64,
    listeners: Vec<Listener>,
    held: VecDeque<(Instant, CallSignal)>,
}

/// Subscriber registry used by the transport implementations.
#[derive(Default)]
pub struct Listeners {
    state: Mutex<ListenerState>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);

        if let Topic::Call(call_id) = &topic {
            prune_held(&mut state.held);
            let mut kept = VecDeque::with_capacity(state.held.len());
            for (at, signal) in state.held.drain(..) {
                if signal.call_id() == call_id {
                    let _ = tx.send(Frame::Call(signal));
                } else {
                    kept.push_back((at, signal));
                }
            }
            state.held = kept;
        }

        state.listeners.push(Listener {
            id,
            topic,
            sender: tx,
        });

        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().listeners.retain(|l| l.id != id);
    }

    /// Delivers a frame to every matching subscriber. Returns the number of
    /// subscribers reached.
    pub fn dispatch(&self, frame: Frame) -> usize {
        let mut state = self.state.lock();
        state.listeners.retain(|l| !l.sender.is_closed());

        let mut delivered = 0;
        for listener in state.listeners.iter().filter(|l| l.topic.matches(&frame)) {
            if listener.sender.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            match frame {
                Frame::Call(CallSignal::CallEnded(ended)) => {
                    log::debug!("Dropping call-ended for untracked call {}", ended.call_id);
                }
                Frame::Call(signal) if !matches!(signal, CallSignal::Offer(_)) => {
                    log::debug!("Holding {} for call {}", signal.name(), signal.call_id());
                    prune_held(&mut state.held);
                    if state.held.len() >= HELD_SIGNAL_LIMIT {
                        state.held.pop_front();
                    }
                    state.held.push_back((Instant::now(), signal));
                }
                other => log::debug!("No subscriber for frame {:?}", other),
            }
        }

        delivered
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.held.clear();
    }
}

fn prune_held(held: &mut VecDeque<(Instant, CallSignal)>) {
    let now = Instant::now();
    while let Some((at, _)) = held.front() {
        if now.duration_since(*at) > HELD_SIGNAL_TTL {
            held.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IceCandidate;
    use crate::signaling::{CallEndedPayload, CallRef, IceCandidatePayload};

    fn candidate(call_id: &str, n: u32) -> Frame {
        Frame::Call(CallSignal::IceCandidate(IceCandidatePayload {
            candidate: IceCandidate::new(format!("candidate:{}", n)),
            to: "bob".into(),
            from: Some("alice".into()),
            call_id: call_id.into(),
        }))
    }

    #[tokio::test]
    async fn test_held_signals_flush_to_first_subscriber_in_order() {
        let listeners = Listeners::new();
        assert_eq!(listeners.dispatch(candidate("c1", 1)), 0);
        assert_eq!(listeners.dispatch(candidate("c2", 9)), 0);
        assert_eq!(listeners.dispatch(candidate("c1", 2)), 0);

        let mut sub = listeners.subscribe(Topic::Call("c1".into()));
        for expected in ["candidate:1", "candidate:2"] {
            match sub.events.recv().await {
                Some(Frame::Call(CallSignal::IceCandidate(p))) => {
                    assert_eq!(p.candidate.candidate, expected)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(sub.events.try_recv().is_err());

        // c2 is still held for its own subscriber.
        let mut other = listeners.subscribe(Topic::Call("c2".into()));
        assert!(other.events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let listeners = Listeners::new();
        let sub = listeners.subscribe(Topic::Call("c1".into()));
        listeners.unsubscribe(sub.id);

        let end = Frame::Call(CallSignal::EndCall(CallRef {
            to: "bob".into(),
            from: None,
            call_id: "c1".into(),
        }));
        assert_eq!(listeners.dispatch(end), 0);
    }

    #[tokio::test]
    async fn test_untracked_call_ended_echo_is_not_held() {
        let listeners = Listeners::new();
        let echo = Frame::Call(CallSignal::CallEnded(CallEndedPayload {
            call_id: "c1".into(),
            from: "alice".into(),
        }));
        assert_eq!(listeners.dispatch(echo), 0);

        let mut sub = listeners.subscribe(Topic::Call("c1".into()));
        assert!(sub.events.try_recv().is_err());
    }
}
