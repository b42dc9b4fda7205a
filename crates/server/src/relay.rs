use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wavecast_protocol::{Envelope, Payload};

use crate::room::{Room, RoomFrame};
use crate::web::AppState;

/// Sliding-window rate limiter for one connection's inbound messages.
pub struct MessageRateLimiter {
    timestamps: std::collections::VecDeque<Instant>,
    max_messages: usize,
    window_secs: u64,
}

impl MessageRateLimiter {
    pub fn new(max_messages: usize, window_secs: u64) -> Self {
        Self {
            timestamps: std::collections::VecDeque::new(),
            max_messages,
            window_secs,
        }
    }

    /// Record one message; false means over the limit and the message
    /// should be rejected.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front).as_secs() >= self.window_secs {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() >= self.max_messages {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }
}

/// One participant's WebSocket connection to a stream room.
///
/// Joining kicks any previous connection for the same user, confirms the
/// connection, replays recent chat, and announces the join to the room.
/// Inbound traffic is rate limited, stamped with the authenticated sender,
/// and fanned out per message type. Leaving announces the departure and
/// prunes the room when it empties.
pub async fn handle_stream_ws(
    mut socket: WebSocket,
    stream_id: String,
    user_id: String,
    state: Arc<AppState>,
) {
    let room = state.rooms.get_or_create(&stream_id).await;

    // An older connection for this user must hang up first. The kick goes
    // out before we subscribe, so we never see our own.
    room.kick(&user_id);
    let mut frames = room.subscribe();
    let newly_joined = room.join(&user_id).await;
    info!(%stream_id, %user_id, "Participant connected");

    let connected = Envelope::new(
        Payload::Success {
            message: format!("connected to stream {stream_id}"),
        },
        &stream_id,
    );
    if send_direct(&mut socket, &connected).await.is_err() {
        room.leave(&user_id).await;
        state.rooms.prune_if_empty(&stream_id).await;
        return;
    }

    // Late joiners get recent chat context.
    for message in room.recent_chat(state.rooms.replay_limit()).await {
        let sender = message.user_id.clone();
        let mut envelope = Envelope::new(Payload::ChatMessage(message), &stream_id);
        envelope.sender_id = sender;
        envelope.target_id = Some(user_id.clone());
        if send_direct(&mut socket, &envelope).await.is_err() {
            break;
        }
    }

    if newly_joined {
        let joined = Envelope::new(
            Payload::UserJoined {
                user_id: user_id.clone(),
            },
            &stream_id,
        );
        room.send_to(None, Some(user_id.as_str()), &joined);
    }

    let mut limiter = MessageRateLimiter::new(
        state.config.signaling.rate_limit_messages,
        state.config.signaling.rate_limit_window_secs,
    );
    let mut replaced = false;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(RoomFrame::Kick { user_id: kicked }) => {
                    if kicked == user_id {
                        info!(%stream_id, %user_id, "Connection replaced by a newer one");
                        let notice = Envelope::error("connection replaced", &stream_id);
                        let _ = send_direct(&mut socket, &notice).await;
                        replaced = true;
                        break;
                    }
                }
                Ok(RoomFrame::Envelope { target, exclude, json }) => {
                    if exclude.as_deref() == Some(user_id.as_str()) {
                        continue;
                    }
                    if let Some(target) = target.as_deref() {
                        if target != user_id {
                            continue;
                        }
                    }
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%stream_id, %user_id, skipped, "Connection lagged behind the room bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if !limiter.check() {
                        warn!(%stream_id, %user_id, "Rate limit exceeded");
                        let notice = Envelope::error("rate limit exceeded", &stream_id);
                        if send_direct(&mut socket, &notice).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => route_inbound(&room, &stream_id, &user_id, envelope).await,
                        Err(e) => {
                            debug!(%stream_id, %user_id, "Unparseable message: {e}");
                            let notice = Envelope::error(
                                format!("invalid message format: {e}"),
                                &stream_id,
                            );
                            if send_direct(&mut socket, &notice).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%stream_id, %user_id, "WebSocket error: {e}");
                    break;
                }
            },
        }
    }

    // A replaced connection must not tear down the membership its
    // replacement relies on.
    if !replaced {
        let was_member = room.leave(&user_id).await;
        info!(%stream_id, %user_id, "Participant disconnected");
        if was_member {
            let left = Envelope::new(
                Payload::UserLeft {
                    user_id: user_id.clone(),
                },
                &stream_id,
            );
            room.send_to(None, None, &left);
        }
        state.rooms.prune_if_empty(&stream_id).await;
    }
}

/// Fan out one inbound envelope. The relay stamps `sender_id` and the
/// path's stream id; whatever the client claimed is overwritten.
async fn route_inbound(room: &Room, stream_id: &str, user_id: &str, mut envelope: Envelope) {
    envelope.sender_id = Some(user_id.to_string());
    envelope.stream_id = stream_id.to_string();

    match &mut envelope.payload {
        // Negotiation traffic goes to its target, or to everyone but the
        // sender when untargeted.
        Payload::Offer(_) | Payload::Answer(_) | Payload::IceCandidate(_) => {
            let target = envelope.target_id.clone();
            room.send_to(target.as_deref(), Some(user_id), &envelope);
        }
        Payload::ChatMessage(message) => {
            let content = message.content.trim().to_string();
            if content.is_empty() {
                return;
            }
            message.content = content;
            message.message_id = Some(Uuid::new_v4().to_string());
            message.user_id = Some(user_id.to_string());
            message.timestamp = Some(Utc::now());
            let stored = message.clone();
            room.push_chat(stored).await;
            // Everyone including the sender: the relay is the ordering
            // authority for chat.
            room.send_to(None, None, &envelope);
        }
        Payload::StreamStarted { .. } | Payload::StreamEnded {} => {
            room.send_to(None, Some(user_id), &envelope);
        }
        // Server-originated event types are not accepted from clients.
        Payload::UserJoined { .. }
        | Payload::UserLeft { .. }
        | Payload::Error { .. }
        | Payload::Success { .. } => {
            debug!(
                %stream_id,
                %user_id,
                kind = envelope.payload.kind(),
                "Ignoring client-sent server event"
            );
        }
    }
}

async fn send_direct(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    let json = serde_json::to_string(envelope).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_rejects_over_the_window() {
        let mut limiter = MessageRateLimiter::new(3, 60);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn rate_limiter_window_expires() {
        let mut limiter = MessageRateLimiter::new(2, 0);
        assert!(limiter.check());
        // A zero-second window expires entries immediately.
        assert!(limiter.check());
        assert!(limiter.check());
    }
}
