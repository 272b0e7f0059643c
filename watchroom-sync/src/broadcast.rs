//! Room-scoped fan-out to every connected session.
//!
//! Uses tokio broadcast channels: each event is encoded once and the same
//! `Arc<String>` frame is handed to every subscriber. Unlike a relay, the
//! sender is NOT filtered out: coordinated commands must reach the proposer
//! too.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerEvent};

/// Encoded frame shared by all receivers.
pub type Frame = Arc<String>;

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    /// Sessions subscribed through [`BroadcastGroup::add_peer`]
    peers: RwLock<HashSet<Uuid>>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may lag behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
        }
    }

    /// Register a session and return its receiver.
    pub async fn add_peer(&self, session_id: Uuid) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.insert(session_id);
        self.sender.subscribe()
    }

    /// Returns `false` if the session was not registered.
    pub async fn remove_peer(&self, session_id: &Uuid) -> bool {
        self.peers.write().await.remove(session_id)
    }

    /// Send to every subscriber. Returns the number of receivers reached.
    pub fn broadcast(&self, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        Ok(self.sender.send(frame).unwrap_or(0))
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// Maps room ids to broadcast groups so traffic never crosses rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Broadcast to a room if anyone ever subscribed to it.
    pub async fn broadcast(&self, room_id: &str, event: &ServerEvent) -> Result<usize, ProtocolError> {
        match self.get(room_id).await {
            Some(group) => group.broadcast(event),
            None => Ok(0),
        }
    }

    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.peer_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
