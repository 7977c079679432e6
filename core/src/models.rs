//! Data models for Hearth

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn wants_video(self) -> bool {
        matches!(self, CallType::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::Failed)
    }

    /// States that have not reached `Connected` yet and are subject to the
    /// connect timeout.
    pub fn is_pending(self) -> bool {
        matches!(self, CallState::Idle | CallState::Ringing | CallState::Connecting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    LocalRejected,
    RemoteRejected,
    MediaAccessDenied,
    NegotiationFailed,
    SignalingFailed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Browser-compatible `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// STUN/TURN server entry handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Free public STUN servers, used for NAT traversal only.
    pub fn public_defaults() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}

/// Call history entry created through the data service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: CallType,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    None,
    Image,
    Video,
    Voice,
}

impl MediaType {
    /// Text shown when a media message has no caption.
    pub fn placeholder(self) -> &'static str {
        match self {
            MediaType::None => "",
            MediaType::Image => "📷 Photo",
            MediaType::Video => "🎥 Video",
            MediaType::Voice => "🎤 Voice message",
        }
    }

    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaType::Image
        } else if mime.starts_with("video/") {
            MediaType::Video
        } else if mime.starts_with("audio/") {
            MediaType::Voice
        } else {
            MediaType::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Keyed by reacting user id, so each user holds at most one reaction.
    #[serde(default)]
    pub reactions: BTreeMap<String, Reaction>,
}

impl Message {
    /// Marks the message read. Returns false if it already was.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.read_at = Some(at);
        true
    }

    pub fn set_reaction(&mut self, user_id: &str, emoji: &str, at: DateTime<Utc>) {
        self.reactions.insert(
            user_id.to_string(),
            Reaction {
                emoji: emoji.to_string(),
                reacted_at: at,
            },
        );
    }

    pub fn clear_reaction(&mut self, user_id: &str) -> bool {
        self.reactions.remove(user_id).is_some()
    }

    /// One-line summary used in the thread list.
    pub fn preview(&self) -> String {
        let text = if self.text.is_empty() {
            self.media_type.placeholder()
        } else {
            self.text.as_str()
        };
        text.chars().take(50).collect()
    }
}

/// Message as submitted to the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub thread_id: String,
    pub text: String,
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl OutgoingMessage {
    /// Builds a message, filling the media placeholder when there is no
    /// caption. Media messages must carry a URL and text-only messages must
    /// not be blank.
    pub fn new(
        thread_id: &str,
        text: &str,
        media: Option<(MediaType, String)>,
    ) -> crate::Result<Self> {
        let text = text.trim();
        match media {
            Some((MediaType::None, _)) => Err(crate::Error::InvalidMessage(
                "media attachment without a media type".to_string(),
            )),
            Some((media_type, url)) => {
                if url.is_empty() {
                    return Err(crate::Error::InvalidMessage(
                        "media message without a URL".to_string(),
                    ));
                }
                let text = if text.is_empty() {
                    media_type.placeholder().to_string()
                } else {
                    text.to_string()
                };
                Ok(Self {
                    thread_id: thread_id.to_string(),
                    text,
                    media_type,
                    media_url: Some(url),
                })
            }
            None if text.is_empty() => {
                Err(crate::Error::InvalidMessage("message is empty".to_string()))
            }
            None => Ok(Self {
                thread_id: thread_id.to_string(),
                text: text.to_string(),
                media_type: MediaType::None,
                media_url: None,
            }),
        }
    }
}

// ============================================================================
// Threads
// ============================================================================

/// The two users of a thread. Stored sorted so `(a, b)` and `(b, a)` are the
/// same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[String; 2]", into = "[String; 2]")]
pub struct Participants {
    low: String,
    high: String,
}

impl Participants {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The participant that is not `user_id`.
    pub fn other(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl From<[String; 2]> for Participants {
    fn from([a, b]: [String; 2]) -> Self {
        Self::new(a, b)
    }
}

impl From<Participants> for [String; 2] {
    fn from(p: Participants) -> Self {
        [p.low, p.high]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Direct,
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageThread {
    pub id: String,
    pub participant_ids: Participants,
    pub initiator_id: String,
    pub is_request: bool,
    pub request_state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl MessageThread {
    pub fn new(id: &str, initiator_id: &str, peer_id: &str, is_request: bool) -> Self {
        Self {
            id: id.to_string(),
            participant_ids: Participants::new(initiator_id, peer_id),
            initiator_id: initiator_id.to_string(),
            is_request,
            request_state: if is_request {
                RequestState::Pending
            } else {
                RequestState::Direct
            },
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        self.participant_ids.other(user_id)
    }

    pub fn is_pending(&self) -> bool {
        self.request_state == RequestState::Pending
    }

    /// Records `message` as the latest activity if it is not older than the
    /// current summary.
    pub fn touch(&mut self, message: &Message) {
        let newer = self
            .last_message_at
            .map_or(true, |at| message.created_at >= at);
        if newer {
            self.last_message = Some(message.preview());
            self.last_message_at = Some(message.created_at);
        }
    }
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Relationship between the current user and another user, as reported by
/// the data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub following: bool,
    pub followed_by: bool,
    pub friends: bool,
    pub blocked: bool,
}

impl Relationship {
    pub fn is_mutual(&self) -> bool {
        self.friends || (self.following && self.followed_by)
    }
}
