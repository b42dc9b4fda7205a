use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One signaling message unit as carried on the WebSocket: a typed payload
/// plus addressing. `sender_id` is stamped by the server on forwarded
/// messages; `target_id` requests delivery to a single participant instead
/// of the whole room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub stream_id: String,
}

/// Signaling payloads, discriminated by the wire `type` field with the
/// type-specific body under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// WebRTC SDP offer toward one participant
    Offer(SessionDescription),
    /// WebRTC SDP answer back to the offerer
    Answer(SessionDescription),
    /// Trickle ICE candidate exchange
    IceCandidate(IceCandidate),
    /// Chat line. Outbound carries only `content`; the server stamps the rest.
    ChatMessage(ChatMessage),
    /// A participant joined the stream room
    UserJoined { user_id: String },
    /// A participant left the stream room
    UserLeft { user_id: String },
    /// The streamer went live
    StreamStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// The stream was torn down; viewers should stop viewing
    StreamEnded {},
    /// Error report, non-fatal to the session
    Error { message: String },
    /// Server-side confirmation (connect, join)
    Success { message: String },
}

impl Payload {
    /// Wire name of the `type` tag, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Offer(_) => "offer",
            Payload::Answer(_) => "answer",
            Payload::IceCandidate(_) => "ice_candidate",
            Payload::ChatMessage(_) => "chat_message",
            Payload::UserJoined { .. } => "user_joined",
            Payload::UserLeft { .. } => "user_left",
            Payload::StreamStarted { .. } => "stream_started",
            Payload::StreamEnded {} => "stream_ended",
            Payload::Error { .. } => "error",
            Payload::Success { .. } => "success",
        }
    }
}

/// An SDP session description (`data` of `offer`/`answer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A trickle ICE candidate. Member names are camelCase on the wire — this is
/// the browser's RTCIceCandidateInit JSON shape, not our snake_case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
}

/// Chat line. Clients send `{ content }`; the server stamps `message_id`,
/// `user_id`, and `timestamp` before echoing to the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Outbound chat body: content only, server fills in the rest.
    pub fn outbound(content: impl Into<String>) -> Self {
        Self {
            message_id: None,
            user_id: None,
            content: content.into(),
            timestamp: None,
        }
    }
}

impl Envelope {
    pub fn new(payload: Payload, stream_id: impl Into<String>) -> Self {
        Self {
            payload,
            sender_id: None,
            target_id: None,
            stream_id: stream_id.into(),
        }
    }

    /// Address this envelope to a single participant.
    pub fn to(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn offer(sdp: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            Payload::Offer(SessionDescription {
                kind: SdpKind::Offer,
                sdp: sdp.into(),
            }),
            stream_id,
        )
    }

    pub fn answer(sdp: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            Payload::Answer(SessionDescription {
                kind: SdpKind::Answer,
                sdp: sdp.into(),
            }),
            stream_id,
        )
    }

    pub fn ice_candidate(candidate: IceCandidate, stream_id: impl Into<String>) -> Self {
        Self::new(Payload::IceCandidate(candidate), stream_id)
    }

    pub fn chat(content: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(Payload::ChatMessage(ChatMessage::outbound(content)), stream_id)
    }

    pub fn error(message: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            Payload::Error {
                message: message.into(),
            },
            stream_id,
        )
    }
}
