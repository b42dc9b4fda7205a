use std::collections::{BTreeSet, HashMap, VecDeque};

use wavecast_protocol::ChatMessage;

use crate::error::SessionError;
use crate::media::LocalMedia;
use crate::peer::RemoteStream;

/// Signaling channel lifecycle as observed by the UI.
///
/// `Connected` is the instant the channel is up, before the role-specific
/// `Streaming`/`Viewing` state is applied in the same call; a snapshot taken
/// afterwards sees the role state, which implies a connected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Viewing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Streamer,
    Viewer,
}

/// Everything a streaming session knows, readable as one snapshot.
///
/// Mutation goes exclusively through [`SessionState::apply`]; callbacks and
/// the router dispatch [`SessionAction`]s instead of poking fields, so every
/// transition is total and the state can never be observed mid-update.
#[derive(Clone)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub role: Option<Role>,
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    pub is_streaming: bool,
    pub is_viewing: bool,
    pub local_media: Option<LocalMedia>,
    /// Remote media keyed by participant, mirrors the peer registry 1:1.
    pub remote_streams: HashMap<String, RemoteStream>,
    /// Sliding window of chat lines, oldest first.
    pub chat_log: VecDeque<ChatMessage>,
    pub roster: BTreeSet<String>,
    pub last_error: Option<SessionError>,
    chat_limit: usize,
}

/// Closed set of state transitions.
#[derive(Debug)]
pub enum SessionAction {
    SetLocalMedia(Option<LocalMedia>),
    AddRemoteStream {
        participant_id: String,
        stream: RemoteStream,
    },
    RemoveRemoteStream {
        participant_id: String,
    },
    SetCurrentSession {
        session_id: Option<String>,
        role: Option<Role>,
    },
    SetConnectionState(ConnectionState),
    SetConnected(bool),
    SetStreaming(bool),
    SetViewing(bool),
    AppendChat(ChatMessage),
    ClearChat,
    RosterJoin(String),
    RosterLeave(String),
    SetError(Option<SessionError>),
    /// Back to the initial state. Local media survives so a stopped viewer
    /// keeps an initialized camera; everything session-scoped is dropped.
    Reset,
}

impl SessionState {
    pub fn new(chat_limit: usize) -> Self {
        Self {
            session_id: None,
            role: None,
            connection_state: ConnectionState::Disconnected,
            is_connected: false,
            is_streaming: false,
            is_viewing: false,
            local_media: None,
            remote_streams: HashMap::new(),
            chat_log: VecDeque::new(),
            roster: BTreeSet::new(),
            last_error: None,
            chat_limit: chat_limit.max(1),
        }
    }

    pub fn apply(&mut self, action: SessionAction) {
        match action {
            SessionAction::SetLocalMedia(media) => {
                if let Some(old) = self.local_media.take() {
                    // Re-setting the same acquisition is not a replacement.
                    let same = media.as_ref().is_some_and(|m| m.same_handle(&old));
                    if !same {
                        old.stop();
                    }
                }
                self.local_media = media;
            }
            SessionAction::AddRemoteStream {
                participant_id,
                stream,
            } => {
                self.remote_streams.insert(participant_id, stream);
            }
            SessionAction::RemoveRemoteStream { participant_id } => {
                self.remote_streams.remove(&participant_id);
            }
            SessionAction::SetCurrentSession { session_id, role } => {
                self.session_id = session_id;
                self.role = role;
            }
            SessionAction::SetConnectionState(state) => self.connection_state = state,
            SessionAction::SetConnected(connected) => self.is_connected = connected,
            SessionAction::SetStreaming(streaming) => self.is_streaming = streaming,
            SessionAction::SetViewing(viewing) => self.is_viewing = viewing,
            SessionAction::AppendChat(message) => {
                self.chat_log.push_back(message);
                while self.chat_log.len() > self.chat_limit {
                    self.chat_log.pop_front();
                }
            }
            SessionAction::ClearChat => self.chat_log.clear(),
            SessionAction::RosterJoin(user_id) => {
                self.roster.insert(user_id);
            }
            SessionAction::RosterLeave(user_id) => {
                self.roster.remove(&user_id);
            }
            SessionAction::SetError(error) => self.last_error = error,
            SessionAction::Reset => {
                let media = self.local_media.take();
                *self = SessionState::new(self.chat_limit);
                self.local_media = media;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource, SampleTrackSource};

    fn chat(content: &str) -> ChatMessage {
        ChatMessage::outbound(content)
    }

    #[test]
    fn chat_log_is_a_sliding_window() {
        let mut state = SessionState::new(100);
        for i in 0..120 {
            state.apply(SessionAction::AppendChat(chat(&format!("msg-{i}"))));
        }
        assert_eq!(state.chat_log.len(), 100);
        assert_eq!(state.chat_log.front().unwrap().content, "msg-20");
        assert_eq!(state.chat_log.back().unwrap().content, "msg-119");
    }

    #[test]
    fn replacing_local_media_stops_the_old_acquisition() {
        let source = SampleTrackSource;
        let first = source.open(&MediaConstraints::default()).unwrap();
        let second = source.open(&MediaConstraints::default()).unwrap();

        let mut state = SessionState::new(100);
        state.apply(SessionAction::SetLocalMedia(Some(first.clone())));
        state.apply(SessionAction::SetLocalMedia(Some(second.clone())));
        assert!(first.is_stopped());
        assert!(!second.is_stopped());

        // Same handle again must not stop it.
        state.apply(SessionAction::SetLocalMedia(Some(second.clone())));
        assert!(!second.is_stopped());
    }

    #[test]
    fn reset_preserves_local_media_only() {
        let media = SampleTrackSource.open(&MediaConstraints::default()).unwrap();
        let mut state = SessionState::new(100);
        state.apply(SessionAction::SetLocalMedia(Some(media.clone())));
        state.apply(SessionAction::SetCurrentSession {
            session_id: Some("s1".into()),
            role: Some(Role::Viewer),
        });
        state.apply(SessionAction::SetConnected(true));
        state.apply(SessionAction::SetViewing(true));
        state.apply(SessionAction::SetConnectionState(ConnectionState::Viewing));
        state.apply(SessionAction::AppendChat(chat("hello")));
        state.apply(SessionAction::RosterJoin("alice".into()));

        state.apply(SessionAction::Reset);

        assert!(state.session_id.is_none());
        assert!(state.role.is_none());
        assert_eq!(state.connection_state, ConnectionState::Disconnected);
        assert!(!state.is_connected);
        assert!(!state.is_viewing);
        assert!(state.chat_log.is_empty());
        assert!(state.roster.is_empty());
        assert!(state.remote_streams.is_empty());
        assert!(state.last_error.is_none());
        // Camera stays initialized across a stop.
        assert!(state.local_media.as_ref().unwrap().same_handle(&media));
        assert!(!media.is_stopped());
    }

    #[test]
    fn remote_stream_removal_is_idempotent() {
        let mut state = SessionState::new(100);
        for id in ["p1", "p2", "p3"] {
            state.apply(SessionAction::AddRemoteStream {
                participant_id: id.to_string(),
                stream: RemoteStream::new(id.to_string()),
            });
        }
        state.apply(SessionAction::RemoveRemoteStream {
            participant_id: "p2".into(),
        });
        state.apply(SessionAction::RemoveRemoteStream {
            participant_id: "p2".into(),
        });
        let mut ids: Vec<_> = state.remote_streams.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, ["p1", "p3"]);
    }

    #[test]
    fn roster_tracks_joins_and_leaves() {
        let mut state = SessionState::new(100);
        state.apply(SessionAction::RosterJoin("a".into()));
        state.apply(SessionAction::RosterJoin("b".into()));
        state.apply(SessionAction::RosterJoin("a".into()));
        state.apply(SessionAction::RosterLeave("b".into()));
        state.apply(SessionAction::RosterLeave("missing".into()));
        assert_eq!(state.roster.iter().cloned().collect::<Vec<_>>(), ["a"]);
    }
}
