//! Typed access to the keys that make up one room.
//!
//! ```text
//! room:{id}       hash  videoUrl, currentTime, isPlaying, status, lastServerTimestamp
//! users:{id}      set   display names present
//! ready:{id}      set   display names ready in the current episode
//! chat:{id}       list  JSON chat messages, newest last
//! lock:room:{id}  flag  proposal gate, short TTL
//! ```
//!
//! The first four keys share one expiry lifecycle: they are armed and
//! cleared together by [`RoomStore::arm_idle_ttl`] / [`RoomStore::persist`].

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{KeyValueStore, StoreError};
use crate::protocol::{ChatMessage, PlaybackState, RoomStatus};

const F_VIDEO_URL: &str = "videoUrl";
const F_CURRENT_TIME: &str = "currentTime";
const F_IS_PLAYING: &str = "isPlaying";
const F_STATUS: &str = "status";
const F_LAST_SERVER_TS: &str = "lastServerTimestamp";

pub fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

pub fn users_key(room_id: &str) -> String {
    format!("users:{room_id}")
}

pub fn ready_key(room_id: &str) -> String {
    format!("ready:{room_id}")
}

pub fn chat_key(room_id: &str) -> String {
    format!("chat:{room_id}")
}

pub fn lock_key(room_id: &str) -> String {
    format!("lock:room:{room_id}")
}

#[derive(Clone)]
pub struct RoomStore {
    kv: Arc<KeyValueStore>,
    idle_ttl_ms: u64,
    chat_limit: usize,
}

impl RoomStore {
    pub fn new(kv: Arc<KeyValueStore>, idle_ttl_ms: u64, chat_limit: usize) -> Self {
        Self {
            kv,
            idle_ttl_ms,
            chat_limit,
        }
    }

    pub fn kv(&self) -> &Arc<KeyValueStore> {
        &self.kv
    }

    pub fn idle_ttl_ms(&self) -> u64 {
        self.idle_ttl_ms
    }

    fn lifecycle_keys(room_id: &str) -> [String; 4] {
        [
            room_key(room_id),
            users_key(room_id),
            ready_key(room_id),
            chat_key(room_id),
        ]
    }

    // ─── Room hash ────────────────────────────────────────────────────

    /// Initialize an empty room whose keys expire after the idle window.
    pub fn create(&self, room_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let state = PlaybackState {
            last_server_timestamp: now_ms,
            ..PlaybackState::default()
        };
        self.save(room_id, &state)?;
        self.kv.ensure_set(&users_key(room_id))?;
        self.kv.ensure_set(&ready_key(room_id))?;
        self.kv.ensure_list(&chat_key(room_id))?;
        self.arm_idle_ttl(room_id)
    }

    pub fn exists(&self, room_id: &str) -> Result<bool, StoreError> {
        self.kv.exists(&room_key(room_id))
    }

    /// `None` if the room was never created or has expired.
    pub fn load(&self, room_id: &str) -> Result<Option<PlaybackState>, StoreError> {
        let key = room_key(room_id);
        match self.kv.hget_all(&key)? {
            None => Ok(None),
            Some(fields) => decode_state(&key, &fields).map(Some),
        }
    }

    pub fn save(&self, room_id: &str, state: &PlaybackState) -> Result<(), StoreError> {
        self.kv.hset_multiple(
            &room_key(room_id),
            &[
                (F_VIDEO_URL, state.video_url.clone()),
                (F_CURRENT_TIME, state.current_time.to_string()),
                (F_IS_PLAYING, state.is_playing.to_string()),
                (F_STATUS, state.status.as_str().to_string()),
                (F_LAST_SERVER_TS, state.last_server_timestamp.to_string()),
            ],
        )
    }

    /// Ids of every live room.
    pub fn room_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .kv
            .scan_prefix(&room_key(""))?
            .into_iter()
            .filter_map(|key| key.strip_prefix("room:").map(str::to_string))
            .collect())
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Returns `false` if the name is already present.
    pub fn add_user(&self, room_id: &str, username: &str) -> Result<bool, StoreError> {
        self.kv.sadd(&users_key(room_id), username)
    }

    pub fn remove_user(&self, room_id: &str, username: &str) -> Result<bool, StoreError> {
        self.kv.srem(&users_key(room_id), username)
    }

    pub fn is_user(&self, room_id: &str, username: &str) -> Result<bool, StoreError> {
        self.kv.sismember(&users_key(room_id), username)
    }

    pub fn users(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        self.kv.smembers(&users_key(room_id))
    }

    pub fn user_count(&self, room_id: &str) -> Result<usize, StoreError> {
        self.kv.scard(&users_key(room_id))
    }

    pub fn clear_users(&self, room_id: &str) -> Result<(), StoreError> {
        self.kv.sclear(&users_key(room_id))
    }

    // ─── Readiness ────────────────────────────────────────────────────

    pub fn add_ready(&self, room_id: &str, username: &str) -> Result<bool, StoreError> {
        self.kv.sadd(&ready_key(room_id), username)
    }

    pub fn remove_ready(&self, room_id: &str, username: &str) -> Result<bool, StoreError> {
        self.kv.srem(&ready_key(room_id), username)
    }

    pub fn clear_ready(&self, room_id: &str) -> Result<(), StoreError> {
        self.kv.sclear(&ready_key(room_id))
    }

    pub fn ready_count(&self, room_id: &str) -> Result<usize, StoreError> {
        self.kv.scard(&ready_key(room_id))
    }

    pub fn ready_users(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        self.kv.smembers(&ready_key(room_id))
    }

    // ─── Chat ─────────────────────────────────────────────────────────

    pub fn append_chat(&self, room_id: &str, message: &ChatMessage) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(message)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.kv.rpush_capped(&chat_key(room_id), encoded, self.chat_limit)?;
        Ok(())
    }

    /// Oldest first. Entries that fail to parse are skipped.
    pub fn chat_history(&self, room_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .kv
            .lrange_all(&chat_key(room_id))?
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    log::warn!("Dropping unreadable chat entry in room {room_id}: {e}");
                    None
                }
            })
            .collect())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Make all room-scoped keys expire after the idle window.
    pub fn arm_idle_ttl(&self, room_id: &str) -> Result<(), StoreError> {
        // one deadline for all four, so they never expire apart
        self.kv.expire_all(&Self::lifecycle_keys(room_id), self.idle_ttl_ms)?;
        Ok(())
    }

    /// Clear the expiry on all room-scoped keys.
    pub fn persist(&self, room_id: &str) -> Result<(), StoreError> {
        for key in Self::lifecycle_keys(room_id) {
            self.kv.persist(&key)?;
        }
        Ok(())
    }

    /// Remaining TTL per lifecycle key, in `room, users, ready, chat` order.
    pub fn lifecycle_ttls(&self, room_id: &str) -> Result<[Option<u64>; 4], StoreError> {
        let [room, users, ready, chat] = Self::lifecycle_keys(room_id);
        Ok([
            self.kv.ttl_ms(&room)?,
            self.kv.ttl_ms(&users)?,
            self.kv.ttl_ms(&ready)?,
            self.kv.ttl_ms(&chat)?,
        ])
    }

    // ─── Proposal lock ────────────────────────────────────────────────

    pub fn try_lock(&self, room_id: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        self.kv.set_flag_nx(&lock_key(room_id), ttl_ms)
    }

    pub fn is_locked(&self, room_id: &str) -> Result<bool, StoreError> {
        self.kv.exists(&lock_key(room_id))
    }
}

fn decode_state(key: &str, fields: &BTreeMap<String, String>) -> Result<PlaybackState, StoreError> {
    let field = |name: &str| {
        fields.get(name).ok_or_else(|| {
            StoreError::DeserializationError(format!("{key} is missing field {name}"))
        })
    };
    let bad = |name: &str, raw: &str| {
        StoreError::DeserializationError(format!("{key}.{name} has unreadable value {raw:?}"))
    };

    let current_time = field(F_CURRENT_TIME)?;
    let is_playing = field(F_IS_PLAYING)?;
    let status = field(F_STATUS)?;
    let last_ts = field(F_LAST_SERVER_TS)?;

    Ok(PlaybackState {
        video_url: field(F_VIDEO_URL)?.clone(),
        current_time: current_time
            .parse()
            .map_err(|_| bad(F_CURRENT_TIME, current_time))?,
        is_playing: is_playing.parse().map_err(|_| bad(F_IS_PLAYING, is_playing))?,
        status: RoomStatus::parse(status).ok_or_else(|| bad(F_STATUS, status))?,
        last_server_timestamp: last_ts.parse().map_err(|_| bad(F_LAST_SERVER_TS, last_ts))?,
    })
}
