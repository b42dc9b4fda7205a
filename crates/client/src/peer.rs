use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use wavecast_protocol::{IceCandidate, IceConfig, SdpKind, SessionDescription};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::SessionError;
use crate::media::LocalMedia;
use crate::router::SessionEvent;

/// Offer/answer progress for one peer link. Updated only after the
/// corresponding SDP operation succeeds, so a failed negotiation leaves the
/// link in its last good sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Stable,
}

/// One remote track as delivered by the transport.
#[derive(Clone)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: String,
    pub track: Arc<TrackRemote>,
}

impl fmt::Debug for RemoteTrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrackInfo")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Remote media from one participant, mirrored into the session state.
#[derive(Clone)]
pub struct RemoteStream {
    pub participant_id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    pub fn new(participant_id: String) -> Self {
        Self {
            participant_id,
            tracks: Vec::new(),
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("participant_id", &self.participant_id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

/// A peer connection toward one participant. All transport callbacks feed the
/// session event queue tagged with the owning session generation; nothing
/// here touches session state directly.
pub(crate) struct PeerLink {
    participant_id: String,
    is_initiator: bool,
    negotiation: NegotiationState,
    pc: Arc<RTCPeerConnection>,
}

impl PeerLink {
    pub(crate) async fn new(
        participant_id: &str,
        is_initiator: bool,
        ice: &IceConfig,
        events: mpsc::Sender<SessionEvent>,
        generation: u64,
    ) -> Result<Self, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::negotiation(participant_id, e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| SessionError::negotiation(participant_id, e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| SessionError::negotiation(participant_id, e))?,
        );

        // Trickle ICE: forward each candidate as it is discovered.
        {
            let events = events.clone();
            let pid = participant_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let event = SessionEvent::LocalCandidate {
                                generation,
                                participant_id: pid.clone(),
                                candidate: IceCandidate {
                                    candidate: json.candidate,
                                    sdp_mline_index: json.sdp_mline_index,
                                    sdp_mid: json.sdp_mid,
                                },
                            };
                            if events.try_send(event).is_err() {
                                warn!("Event queue full, dropping local ICE candidate");
                            }
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            let pid = participant_id.to_string();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let event = SessionEvent::RemoteTrack {
                    generation,
                    participant_id: pid.clone(),
                    track: RemoteTrackInfo {
                        id: track.id(),
                        kind: track.kind().to_string(),
                        track,
                    },
                };
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(event).await;
                })
            }));
        }

        {
            let pid = participant_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let event = SessionEvent::PeerState {
                    generation,
                    participant_id: pid.clone(),
                    state,
                };
                if events.try_send(event).is_err() {
                    warn!("Event queue full, dropping peer state change");
                }
                Box::pin(async {})
            }));
        }

        Ok(Self {
            participant_id: participant_id.to_string(),
            is_initiator,
            negotiation: NegotiationState::Idle,
            pc,
        })
    }

    pub(crate) fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub(crate) fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub(crate) fn negotiation(&self) -> NegotiationState {
        self.negotiation
    }

    pub(crate) async fn attach_local_tracks(&self, media: &LocalMedia) -> Result<(), SessionError> {
        for track in media.tracks() {
            self.pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        }
        debug!(
            participant_id = %self.participant_id,
            tracks = media.tracks().len(),
            "Attached local tracks"
        );
        Ok(())
    }

    /// Initiator path: produce the offer SDP to send.
    pub(crate) async fn create_offer(&mut self) -> Result<String, SessionError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.negotiation = NegotiationState::OfferSent;
        Ok(sdp)
    }

    /// Non-initiator path: apply a remote offer and produce the answer SDP.
    pub(crate) async fn accept_offer(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<String, SessionError> {
        let remote = to_rtc_description(desc)
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.negotiation = NegotiationState::OfferReceived;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.negotiation = NegotiationState::AnswerSent;
        Ok(sdp)
    }

    /// Initiator path: apply the remote answer to our outstanding offer.
    pub(crate) async fn accept_answer(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), SessionError> {
        let remote = to_rtc_description(desc)
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))?;
        self.negotiation = NegotiationState::Stable;
        Ok(())
    }

    pub(crate) async fn add_remote_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<(), SessionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| SessionError::negotiation(&self.participant_id, e))
    }

    pub(crate) fn mark_stable(&mut self) {
        self.negotiation = NegotiationState::Stable;
    }

    pub(crate) async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(participant_id = %self.participant_id, "Peer connection close: {e}");
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("participant_id", &self.participant_id)
            .field("is_initiator", &self.is_initiator)
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

fn to_rtc_description(
    desc: &SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
}

fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    servers
}
