//! Wire protocol shared by clients and the relay server.
//!
//! Every frame is a JSON object `{"type": <event>, "payload": {...}}`. Frames
//! fall into three closed families: call signaling, thread sync and
//! connection control. `from` is optional on the client side and stamped by
//! the relay with the authenticated sender before delivery.

use crate::models::{CallType, IceCandidate, Message, SessionDescription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Call signaling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub offer: SessionDescription,
    pub to: String,
    pub from: String,
    pub call_id: String,
    pub call_type: CallType,
    #[serde(default)]
    pub caller_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub answer: SessionDescription,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: IceCandidate,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub call_id: String,
}

/// Payload of `end-call` and `reject-call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedPayload {
    pub call_id: String,
    /// User who ended the call.
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CallSignal {
    #[serde(rename = "webrtc-offer")]
    Offer(OfferPayload),

    #[serde(rename = "webrtc-answer")]
    Answer(AnswerPayload),

    #[serde(rename = "webrtc-ice-candidate")]
    IceCandidate(IceCandidatePayload),

    #[serde(rename = "end-call")]
    EndCall(CallRef),

    #[serde(rename = "reject-call")]
    RejectCall(CallRef),

    /// Relay echo of `end-call`, delivered to both parties.
    #[serde(rename = "call-ended")]
    CallEnded(CallEndedPayload),
}

impl CallSignal {
    pub fn call_id(&self) -> &str {
        match self {
            CallSignal::Offer(p) => &p.call_id,
            CallSignal::Answer(p) => &p.call_id,
            CallSignal::IceCandidate(p) => &p.call_id,
            CallSignal::EndCall(p) | CallSignal::RejectCall(p) => &p.call_id,
            CallSignal::CallEnded(p) => &p.call_id,
        }
    }

    /// Addressee, `None` for relay-originated echoes.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            CallSignal::Offer(p) => Some(&p.to),
            CallSignal::Answer(p) => Some(&p.to),
            CallSignal::IceCandidate(p) => Some(&p.to),
            CallSignal::EndCall(p) | CallSignal::RejectCall(p) => Some(&p.to),
            CallSignal::CallEnded(_) => None,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            CallSignal::Offer(p) => Some(&p.from),
            CallSignal::Answer(p) => p.from.as_deref(),
            CallSignal::IceCandidate(p) => p.from.as_deref(),
            CallSignal::EndCall(p) | CallSignal::RejectCall(p) => p.from.as_deref(),
            CallSignal::CallEnded(p) => Some(&p.from),
        }
    }

    /// Overwrites the sender with the authenticated user id.
    pub fn stamp_sender(&mut self, user_id: &str) {
        match self {
            CallSignal::Offer(p) => p.from = user_id.to_string(),
            CallSignal::Answer(p) => p.from = Some(user_id.to_string()),
            CallSignal::IceCandidate(p) => p.from = Some(user_id.to_string()),
            CallSignal::EndCall(p) | CallSignal::RejectCall(p) => {
                p.from = Some(user_id.to_string())
            }
            CallSignal::CallEnded(p) => p.from = user_id.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallSignal::Offer(_) => "webrtc-offer",
            CallSignal::Answer(_) => "webrtc-answer",
            CallSignal::IceCandidate(_) => "webrtc-ice-candidate",
            CallSignal::EndCall(_) => "end-call",
            CallSignal::RejectCall(_) => "reject-call",
            CallSignal::CallEnded(_) => "call-ended",
        }
    }
}

// ============================================================================
// Thread sync
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub thread_id: String,
    pub message: Message,
    #[serde(default)]
    pub is_request: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub thread_id: String,
    pub typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub thread_id: String,
    pub message_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub thread_id: String,
    pub message_id: String,
    /// `None` when the sender removed their reaction.
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ThreadEvent {
    #[serde(rename = "new_message")]
    NewMessage(NewMessagePayload),

    #[serde(rename = "user_typing")]
    UserTyping(TypingPayload),

    #[serde(rename = "message_read")]
    MessageRead(ReadPayload),

    #[serde(rename = "message_reaction")]
    MessageReaction(ReactionPayload),
}

impl ThreadEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            ThreadEvent::NewMessage(p) => &p.thread_id,
            ThreadEvent::UserTyping(p) => &p.thread_id,
            ThreadEvent::MessageRead(p) => &p.thread_id,
            ThreadEvent::MessageReaction(p) => &p.thread_id,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            ThreadEvent::NewMessage(p) => &p.to,
            ThreadEvent::UserTyping(p) => &p.to,
            ThreadEvent::MessageRead(p) => &p.to,
            ThreadEvent::MessageReaction(p) => &p.to,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            ThreadEvent::NewMessage(p) => p.from.as_deref(),
            ThreadEvent::UserTyping(p) => p.from.as_deref(),
            ThreadEvent::MessageRead(p) => p.from.as_deref(),
            ThreadEvent::MessageReaction(p) => p.from.as_deref(),
        }
    }

    pub fn stamp_sender(&mut self, user_id: &str) {
        let from = Some(user_id.to_string());
        match self {
            ThreadEvent::NewMessage(p) => p.from = from,
            ThreadEvent::UserTyping(p) => p.from = from,
            ThreadEvent::MessageRead(p) => p.from = from,
            ThreadEvent::MessageReaction(p) => p.from = from,
        }
    }
}

// ============================================================================
// Connection control
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlFrame {
    #[serde(rename = "authenticate", rename_all = "camelCase")]
    Authenticate {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    #[serde(rename = "authenticated", rename_all = "camelCase")]
    Authenticated { user_id: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Call(CallSignal),
    Thread(ThreadEvent),
    Control(ControlFrame),
}

impl Frame {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            Frame::Call(signal) => signal.recipient(),
            Frame::Thread(event) => Some(event.recipient()),
            Frame::Control(_) => None,
        }
    }

    pub fn stamp_sender(&mut self, user_id: &str) {
        match self {
            Frame::Call(signal) => signal.stamp_sender(user_id),
            Frame::Thread(event) => event.stamp_sender(user_id),
            Frame::Control(_) => {}
        }
    }
}

impl From<CallSignal> for Frame {
    fn from(signal: CallSignal) -> Self {
        Frame::Call(signal)
    }
}

impl From<ThreadEvent> for Frame {
    fn from(event: ThreadEvent) -> Self {
        Frame::Thread(event)
    }
}

impl From<ControlFrame> for Frame {
    fn from(frame: ControlFrame) -> Self {
        Frame::Control(frame)
    }
}

// ============================================================================
// Relay routing
// ============================================================================

/// A frame addressed to one user, produced by [`relay`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub recipient: String,
    pub frame: Frame,
}

/// Routes a frame received from the authenticated user `sender`.
///
/// The sender is stamped on the frame before delivery. `end-call` is
/// forwarded to the peer and additionally echoed to both parties as
/// `call-ended`. Control frames are never relayed.
pub fn relay(sender: &str, mut frame: Frame) -> Vec<Delivery> {
    let recipient = match frame.recipient() {
        Some(to) if !to.is_empty() => to.to_string(),
        _ => return Vec::new(),
    };
    frame.stamp_sender(sender);

    let echo = match &frame {
        Frame::Call(CallSignal::EndCall(end)) => Some(CallSignal::CallEnded(CallEndedPayload {
            call_id: end.call_id.clone(),
            from: sender.to_string(),
        })),
        _ => None,
    };

    let mut deliveries = vec![Delivery {
        recipient: recipient.clone(),
        frame,
    }];

    if let Some(echo) = echo {
        deliveries.push(Delivery {
            recipient,
            frame: Frame::Call(echo.clone()),
        });
        deliveries.push(Delivery {
            recipient: sender.to_string(),
            frame: Frame::Call(echo),
        });
    }

    deliveries
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_shape() {
        let frame = Frame::Call(CallSignal::Offer(OfferPayload {
            offer: SessionDescription::offer("v=0"),
            to: "bob".into(),
            from: "alice".into(),
            call_id: "c1".into(),
            call_type: CallType::Video,
            caller_name: "Alice".into(),
        }));

        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "webrtc-offer",
                "payload": {
                    "offer": { "type": "offer", "sdp": "v=0" },
                    "to": "bob",
                    "from": "alice",
                    "callId": "c1",
                    "callType": "video",
                    "callerName": "Alice"
                }
            })
        );
    }

    #[test]
    fn test_parses_each_family() {
        let ice = r#"{"type":"webrtc-ice-candidate","payload":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0},"to":"bob","callId":"c1"}}"#;
        match Frame::from_json(ice).unwrap() {
            Frame::Call(CallSignal::IceCandidate(p)) => {
                assert_eq!(p.call_id, "c1");
                assert_eq!(p.candidate.sdp_m_line_index, Some(0));
                assert!(p.from.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let typing = r#"{"type":"user_typing","payload":{"to":"bob","threadId":"t1","typing":true}}"#;
        assert!(matches!(
            Frame::from_json(typing).unwrap(),
            Frame::Thread(ThreadEvent::UserTyping(TypingPayload { typing: true, .. }))
        ));

        let ping = r#"{"type":"ping"}"#;
        assert_eq!(Frame::from_json(ping).unwrap(), Frame::Control(ControlFrame::Ping));

        assert!(Frame::from_json(r#"{"type":"bogus","payload":{}}"#).is_err());
    }

    #[test]
    fn test_stamp_sender_overwrites_claimed_sender() {
        let mut frame = Frame::Call(CallSignal::EndCall(CallRef {
            to: "bob".into(),
            from: Some("mallory".into()),
            call_id: "c1".into(),
        }));
        frame.stamp_sender("alice");
        match frame {
            Frame::Call(signal) => assert_eq!(signal.sender(), Some("alice")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_relay_echoes_call_ended_to_both() {
        let frame = Frame::Call(CallSignal::EndCall(CallRef {
            to: "bob".into(),
            from: None,
            call_id: "c1".into(),
        }));

        let deliveries = relay("alice", frame);
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries[0].recipient, "bob");
        let ended: Vec<&str> = deliveries[1..]
            .iter()
            .filter(|d| matches!(d.frame, Frame::Call(CallSignal::CallEnded(_))))
            .map(|d| d.recipient.as_str())
            .collect();
        assert_eq!(ended, vec!["bob", "alice"]);
    }

    #[test]
    fn test_relay_ignores_control_frames() {
        assert!(relay("alice", Frame::Control(ControlFrame::Ping)).is_empty());
    }
}
