use thiserror::Error;

/// Errors surfaced by a streaming session.
///
/// Only `MediaAccess` and `SignalingConnect` abort a requested operation;
/// everything else is recorded on the session state and recovered locally.
/// Nothing here ever escalates past a session reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Capture device permission or hardware failure. Fatal to starting a
    /// session, surfaced to the caller.
    #[error("media access failed: {0}")]
    MediaAccess(String),

    /// The signaling transport failed to open. Fatal to starting, retryable
    /// by the caller.
    #[error("signaling connect failed: {0}")]
    SignalingConnect(String),

    /// An established signaling transport dropped mid-session. The session
    /// survives; the caller decides whether to reconnect.
    #[error("signaling transport lost: {0}")]
    SignalingLost(String),

    /// Malformed or rejected description/candidate during one peer's
    /// negotiation. Recovered locally; the peer link keeps its last good
    /// sub-state.
    #[error("negotiation with {participant_id} failed: {reason}")]
    Negotiation {
        participant_id: String,
        reason: String,
    },

    /// Unparseable or unrecognized signaling input. Dropped and logged.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error envelope sent by the relay (rate limit, rejected input).
    /// The input was well-formed; the server refused it.
    #[error("relay error: {0}")]
    Relay(String),

    /// A peer transport reported failed/closed; the link was torn down.
    #[error("peer transport terminated for {0}")]
    TransportTerminated(String),
}

impl SessionError {
    pub(crate) fn negotiation(participant_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::Negotiation {
            participant_id: participant_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
