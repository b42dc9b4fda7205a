use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wavecast_protocol::{Envelope, IceCandidate, Payload, SessionDescription};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::error::SessionError;
use crate::peer::{PeerLink, RemoteStream, RemoteTrackInfo};
use crate::session::{Shared, shutdown};
use crate::state::{ConnectionState, Role, SessionAction};

/// Everything that can happen to a session, funneled through one queue so
/// signaling frames and transport callbacks are processed in arrival order
/// by a single task. Every event carries the generation of the session
/// incarnation that produced it.
pub(crate) enum SessionEvent {
    /// Raw inbound signaling frame, parsed on the router task.
    Frame { generation: u64, text: String },
    /// Locally discovered ICE candidate to trickle out.
    LocalCandidate {
        generation: u64,
        participant_id: String,
        candidate: IceCandidate,
    },
    /// Remote media arrived on a peer link.
    RemoteTrack {
        generation: u64,
        participant_id: String,
        track: RemoteTrackInfo,
    },
    /// Peer transport state change.
    PeerState {
        generation: u64,
        participant_id: String,
        state: RTCPeerConnectionState,
    },
    /// The signaling transport ended; `reason` is set on abnormal loss.
    TransportClosed {
        generation: u64,
        reason: Option<String>,
    },
}

impl SessionEvent {
    fn generation(&self) -> u64 {
        match self {
            SessionEvent::Frame { generation, .. }
            | SessionEvent::LocalCandidate { generation, .. }
            | SessionEvent::RemoteTrack { generation, .. }
            | SessionEvent::PeerState { generation, .. }
            | SessionEvent::TransportClosed { generation, .. } => *generation,
        }
    }
}

pub(crate) async fn run(shared: Arc<Shared>, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        handle_event(&shared, event).await;
    }
    debug!("Session event loop ended");
}

pub(crate) async fn handle_event(shared: &Arc<Shared>, event: SessionEvent) {
    // Continuations from a superseded session incarnation must not touch
    // current state.
    if event.generation() != shared.generation() {
        debug!("Dropping stale event from a superseded session");
        return;
    }

    match event {
        SessionEvent::Frame { text, .. } => match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => route(shared, envelope).await,
            Err(e) => debug!("Dropping malformed signaling frame: {e}"),
        },
        SessionEvent::LocalCandidate {
            participant_id,
            candidate,
            ..
        } => {
            let Some(stream_id) = shared.current_stream_id() else {
                return;
            };
            shared.send_envelope(Envelope::ice_candidate(candidate, stream_id).to(participant_id));
        }
        SessionEvent::RemoteTrack {
            participant_id,
            track,
            ..
        } => {
            // A track for a peer that was already torn down must not
            // resurrect a state entry with no link behind it.
            if !shared.registry.lock().await.contains(&participant_id) {
                debug!(%participant_id, "Dropping track for a departed peer");
                return;
            }
            info!(%participant_id, kind = %track.kind, "Remote track arrived");
            let mut stream = shared
                .snapshot()
                .remote_streams
                .get(&participant_id)
                .cloned()
                .unwrap_or_else(|| RemoteStream::new(participant_id.clone()));
            stream.tracks.retain(|t| t.id != track.id);
            stream.tracks.push(track);
            shared.apply(SessionAction::AddRemoteStream {
                participant_id,
                stream,
            });
        }
        SessionEvent::PeerState {
            participant_id,
            state,
            ..
        } => match state {
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                info!(%participant_id, ?state, "Peer transport terminated");
                teardown_peer(shared, &participant_id).await;
            }
            RTCPeerConnectionState::Connected => {
                if let Some(link) = shared.registry.lock().await.get_mut(&participant_id) {
                    link.mark_stable();
                }
                info!(%participant_id, "Peer connection established");
            }
            _ => debug!(%participant_id, ?state, "Peer connection state changed"),
        },
        SessionEvent::TransportClosed { reason, .. } => {
            shared.apply(SessionAction::SetConnected(false));
            shared.apply(SessionAction::SetConnectionState(
                ConnectionState::Disconnected,
            ));
            match reason {
                Some(reason) => {
                    warn!("Signaling transport lost: {reason}");
                    shared.apply(SessionAction::SetError(Some(SessionError::SignalingLost(
                        reason,
                    ))));
                }
                None => info!("Signaling transport closed"),
            }
        }
    }
}

/// Dispatch one parsed envelope against the current session.
pub(crate) async fn route(shared: &Arc<Shared>, envelope: Envelope) {
    let Some(stream_id) = shared.current_stream_id() else {
        debug!(
            kind = envelope.payload.kind(),
            "Dropping envelope, no active session"
        );
        return;
    };
    if envelope.stream_id != stream_id {
        debug!(
            got = %envelope.stream_id,
            expected = %stream_id,
            "Dropping envelope addressed to another stream"
        );
        return;
    }

    match envelope.payload {
        Payload::Offer(desc) => {
            let Some(sender) = envelope.sender_id else {
                warn!("Offer without sender_id, dropping");
                return;
            };
            accept_offer(shared, &sender, &desc, &stream_id).await;
        }
        Payload::Answer(desc) => {
            let Some(sender) = envelope.sender_id else {
                warn!("Answer without sender_id, dropping");
                return;
            };
            accept_answer(shared, &sender, &desc).await;
        }
        Payload::IceCandidate(candidate) => {
            let Some(sender) = envelope.sender_id else {
                warn!("ICE candidate without sender_id, dropping");
                return;
            };
            accept_candidate(shared, &sender, &candidate).await;
        }
        Payload::ChatMessage(message) => {
            shared.apply(SessionAction::AppendChat(message));
        }
        Payload::UserJoined { user_id } => {
            info!(%user_id, "Participant joined");
            shared.apply(SessionAction::RosterJoin(user_id.clone()));
            // The streamer side opens the media path toward each arriving
            // viewer.
            let (is_streamer, has_media) = {
                let state = shared.snapshot();
                (
                    state.role == Some(Role::Streamer),
                    state.local_media.is_some(),
                )
            };
            if is_streamer && has_media {
                initiate_offer(shared, &user_id, &stream_id).await;
            }
        }
        Payload::UserLeft { user_id } => {
            info!(%user_id, "Participant left");
            shared.apply(SessionAction::RosterLeave(user_id.clone()));
            teardown_peer(shared, &user_id).await;
        }
        Payload::StreamStarted { title } => {
            info!(?title, "Stream went live");
        }
        Payload::StreamEnded {} => {
            info!("Stream ended by the remote side");
            shutdown(shared, false).await;
        }
        Payload::Error { message } => {
            warn!("Signaling error: {message}");
            shared.apply(SessionAction::SetError(Some(SessionError::Relay(message))));
        }
        Payload::Success { message } => debug!("Signaling: {message}"),
    }
}

/// Non-initiator path: apply a remote offer, answer it, send the answer back
/// to the offerer only. Reuses an existing link for renegotiation.
async fn accept_offer(
    shared: &Arc<Shared>,
    sender: &str,
    desc: &SessionDescription,
    stream_id: &str,
) {
    let generation = shared.generation();
    let mut registry = shared.registry.lock().await;

    if !registry.contains(sender) {
        let link = match PeerLink::new(
            sender,
            false,
            &shared.config.ice,
            shared.events_tx.clone(),
            generation,
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                warn!(participant_id = sender, "Failed to create peer link: {e}");
                return;
            }
        };
        // Local tracks must be attached before the answer is created or the
        // answer will not declare the corresponding media sections.
        if let Some(media) = shared.snapshot().local_media {
            if let Err(e) = link.attach_local_tracks(&media).await {
                warn!(participant_id = sender, "Failed to attach local tracks: {e}");
            }
        }
        registry.insert(link);
    }

    let Some(link) = registry.get_mut(sender) else {
        return;
    };
    match link.accept_offer(desc).await {
        Ok(answer_sdp) => {
            shared.send_envelope(Envelope::answer(answer_sdp, stream_id).to(sender));
            debug!(participant_id = sender, "Answer sent");
        }
        Err(e) => {
            warn!("Negotiation failed, link keeps its last good state: {e}");
            shared.apply(SessionAction::SetError(Some(SessionError::negotiation(
                sender, e,
            ))));
        }
    }
}

/// Initiator path: open a link toward a participant, attach local media, and
/// send the offer. No-op when a link already exists.
async fn initiate_offer(shared: &Arc<Shared>, participant_id: &str, stream_id: &str) {
    let generation = shared.generation();
    let mut registry = shared.registry.lock().await;
    if registry.contains(participant_id) {
        debug!(%participant_id, "Peer link already exists, not re-offering");
        return;
    }

    let mut link = match PeerLink::new(
        participant_id,
        true,
        &shared.config.ice,
        shared.events_tx.clone(),
        generation,
    )
    .await
    {
        Ok(link) => link,
        Err(e) => {
            warn!(%participant_id, "Failed to create peer link: {e}");
            return;
        }
    };

    if let Some(media) = shared.snapshot().local_media {
        if let Err(e) = link.attach_local_tracks(&media).await {
            warn!(%participant_id, "Failed to attach local tracks: {e}");
            link.close().await;
            return;
        }
    }

    match link.create_offer().await {
        Ok(offer_sdp) => {
            registry.insert(link);
            shared.send_envelope(Envelope::offer(offer_sdp, stream_id).to(participant_id));
            debug!(%participant_id, "Offer sent");
        }
        Err(e) => {
            warn!(%participant_id, "Failed to create offer: {e}");
            link.close().await;
        }
    }
}

async fn accept_answer(shared: &Arc<Shared>, sender: &str, desc: &SessionDescription) {
    let mut registry = shared.registry.lock().await;
    match registry.get_mut(sender) {
        Some(link) if link.is_initiator() => {
            if let Err(e) = link.accept_answer(desc).await {
                warn!("Negotiation failed, link keeps its last good state: {e}");
                shared.apply(SessionAction::SetError(Some(SessionError::negotiation(
                    sender, e,
                ))));
            }
        }
        Some(_) => debug!(
            participant_id = sender,
            "Answer for a link we did not offer on, ignoring"
        ),
        None => debug!(
            participant_id = sender,
            "Answer for an unknown peer, presumably already closed"
        ),
    }
}

/// Candidates never create links: one for an unknown participant means the
/// link was already torn down or never offered.
async fn accept_candidate(shared: &Arc<Shared>, sender: &str, candidate: &IceCandidate) {
    let mut registry = shared.registry.lock().await;
    match registry.get_mut(sender) {
        Some(link) => {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                debug!(participant_id = sender, "Rejected remote candidate: {e}");
            }
        }
        None => debug!(
            participant_id = sender,
            "Candidate for an unknown peer, dropping"
        ),
    }
}

/// Remove one peer link and its mirrored remote stream. Idempotent.
pub(crate) async fn teardown_peer(shared: &Arc<Shared>, participant_id: &str) {
    let removed = shared.registry.lock().await.remove(participant_id);
    match removed {
        Some(link) => {
            link.close().await;
            shared.apply(SessionAction::RemoveRemoteStream {
                participant_id: participant_id.to_string(),
            });
            info!(%participant_id, "Peer link torn down");
        }
        None => debug!(%participant_id, "Teardown for an unknown peer, already removed"),
    }
}
