use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info};
use wavecast_protocol::{ChatConfig, ChatMessage, Envelope};

/// One frame on a room's broadcast bus. Every connection in the room
/// receives every frame and filters by addressing locally.
#[derive(Debug, Clone)]
pub enum RoomFrame {
    /// Serialized envelope. `target` restricts delivery to one participant;
    /// `exclude` suppresses delivery to one (typically the sender).
    Envelope {
        target: Option<String>,
        exclude: Option<String>,
        json: String,
    },
    /// An older connection for `user_id` must hang up; a new one took over.
    Kick { user_id: String },
}

/// A stream room: membership, the broadcast bus, and bounded chat history.
pub struct Room {
    pub stream_id: String,
    tx: broadcast::Sender<RoomFrame>,
    members: RwLock<BTreeSet<String>>,
    chat_history: Mutex<VecDeque<ChatMessage>>,
    history_limit: usize,
}

impl Room {
    fn new(stream_id: String, history_limit: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            stream_id,
            tx,
            members: RwLock::new(BTreeSet::new()),
            chat_history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.tx.subscribe()
    }

    /// Tell any existing connection for this user to hang up. Must be sent
    /// before the replacement subscribes, so the new connection never sees
    /// its own kick.
    pub fn kick(&self, user_id: &str) {
        let _ = self.tx.send(RoomFrame::Kick {
            user_id: user_id.to_string(),
        });
    }

    pub fn send_to(&self, target: Option<&str>, exclude: Option<&str>, envelope: &Envelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                debug!("Failed to serialize envelope: {e}");
                return;
            }
        };
        // Err means no receivers, which is fine for an emptying room.
        let _ = self.tx.send(RoomFrame::Envelope {
            target: target.map(str::to_string),
            exclude: exclude.map(str::to_string),
            json,
        });
    }

    /// Returns true when the user was not already a member.
    pub async fn join(&self, user_id: &str) -> bool {
        self.members.write().await.insert(user_id.to_string())
    }

    /// Returns true when the user was a member.
    pub async fn leave(&self, user_id: &str) -> bool {
        self.members.write().await.remove(user_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<String> {
        self.members.read().await.iter().cloned().collect()
    }

    pub async fn push_chat(&self, message: ChatMessage) {
        let mut history = self.chat_history.lock().await;
        history.push_back(message);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// The most recent `limit` chat lines, oldest first.
    pub async fn recent_chat(&self, limit: usize) -> Vec<ChatMessage> {
        let history = self.chat_history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

/// All live rooms, keyed by stream id. Rooms are created on first join and
/// pruned when the last participant leaves.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    chat: ChatConfig,
}

#[derive(Debug, Serialize)]
pub struct StreamSummary {
    pub stream_id: String,
    pub participants: usize,
}

impl RoomRegistry {
    pub fn new(chat: &ChatConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            chat: chat.clone(),
        }
    }

    pub fn replay_limit(&self) -> usize {
        self.chat.replay_limit
    }

    pub async fn get_or_create(&self, stream_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(stream_id) {
                return Arc::clone(room);
            }
        }
        let mut rooms = self.rooms.write().await;
        // Another connection may have won the race between the locks.
        if let Some(room) = rooms.get(stream_id) {
            return Arc::clone(room);
        }
        info!(%stream_id, "Creating stream room");
        let room = Arc::new(Room::new(
            stream_id.to_string(),
            self.chat.history_limit,
        ));
        rooms.insert(stream_id.to_string(), Arc::clone(&room));
        room
    }

    pub async fn get(&self, stream_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(stream_id).map(Arc::clone)
    }

    /// Drop the room if nobody is left in it.
    pub async fn prune_if_empty(&self, stream_id: &str) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(stream_id) {
            Some(room) => room.member_count().await == 0,
            None => return,
        };
        if empty {
            rooms.remove(stream_id);
            info!(%stream_id, "Pruned empty stream room");
        }
    }

    pub async fn summaries(&self) -> Vec<StreamSummary> {
        let rooms = self.rooms.read().await;
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms.values() {
            out.push(StreamSummary {
                stream_id: room.stream_id.clone(),
                participants: room.member_count().await,
            });
        }
        out.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        out
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
