//! JSON wire protocol between browsers and the room server.
//!
//! Every frame is a WebSocket text message holding one JSON object tagged by
//! `"type"`:
//! ```text
//! {"type":"propose_seek","roomId":"…","time":42.0}
//! {"type":"seek_command","time":42.0,"isPlaying":false}
//! ```
//!
//! Inbound frames are a closed set ([`ClientEvent`]). Decoding validates the
//! payload, so handlers never see a negative seek time or an empty URL.

use serde::{Deserialize, Serialize};

/// Longest accepted video URL, in bytes.
pub const MAX_URL_LEN: usize = 2048;
/// Longest accepted chat message, in characters.
pub const MAX_CHAT_LEN: usize = 2000;
/// Longest accepted display name, in characters.
pub const MAX_USERNAME_LEN: usize = 32;

/// Room synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Position is trusted, no barrier active
    #[default]
    Stable,
    /// Resynchronization in progress, playback force-paused
    Seeking,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Seeking => "seeking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stable" => Some(Self::Stable),
            "seeking" => Some(Self::Seeking),
            _ => None,
        }
    }
}

/// Authoritative playback state of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    /// Empty = no video loaded
    pub video_url: String,
    /// Position in seconds, valid at `last_server_timestamp`
    pub current_time: f64,
    pub is_playing: bool,
    pub status: RoomStatus,
    /// Server epoch ms at which the position becomes valid
    pub last_server_timestamp: u64,
}

/// A chat log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub user: String,
    /// Display string (`HH:MM`, UTC)
    pub timestamp: String,
    pub avatar: String,
    pub is_system: bool,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    CreateRoom,
    CheckRoom {
        room_id: String,
    },
    /// Clock probe, echoed back with the server's time
    TimeSync {
        client_time: u64,
    },
    Join {
        room_id: String,
        /// Empty = let the server pick a name
        #[serde(default)]
        username: String,
    },
    LoadVideo {
        room_id: String,
        url: String,
    },
    ProposeSeek {
        room_id: String,
        time: f64,
    },
    ProposeState {
        room_id: String,
        is_playing: bool,
        time: f64,
    },
    SeekReady {
        room_id: String,
    },
    PlayerError {
        room_id: String,
        #[serde(default)]
        message: String,
    },
    ChatSend {
        room_id: String,
        text: String,
        #[serde(default)]
        username: String,
    },
}

impl ClientEvent {
    /// Room the event targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::CreateRoom | Self::TimeSync { .. } => None,
            Self::CheckRoom { room_id }
            | Self::Join { room_id, .. }
            | Self::LoadVideo { room_id, .. }
            | Self::ProposeSeek { room_id, .. }
            | Self::ProposeState { room_id, .. }
            | Self::SeekReady { room_id }
            | Self::PlayerError { room_id, .. }
            | Self::ChatSend { room_id, .. } => Some(room_id),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateRoom => "create_room",
            Self::CheckRoom { .. } => "check_room",
            Self::TimeSync { .. } => "time_sync",
            Self::Join { .. } => "join",
            Self::LoadVideo { .. } => "load_video",
            Self::ProposeSeek { .. } => "propose_seek",
            Self::ProposeState { .. } => "propose_state",
            Self::SeekReady { .. } => "seek_ready",
            Self::PlayerError { .. } => "player_error",
            Self::ChatSend { .. } => "chat_send",
        }
    }

    /// Check payload constraints the type system can't express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(room_id) = self.room_id() {
            if room_id.trim().is_empty() {
                return Err(ProtocolError::InvalidPayload("roomId must not be empty".into()));
            }
        }
        match self {
            Self::Join { username, .. } => {
                if username.trim().chars().count() > MAX_USERNAME_LEN {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "username longer than {MAX_USERNAME_LEN} characters"
                    )));
                }
            }
            Self::LoadVideo { url, .. } => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(ProtocolError::InvalidPayload("url must not be empty".into()));
                }
                if url.len() > MAX_URL_LEN {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "url longer than {MAX_URL_LEN} bytes"
                    )));
                }
            }
            Self::ProposeSeek { time, .. } | Self::ProposeState { time, .. } => {
                validate_time(*time)?;
            }
            Self::ChatSend { text, .. } => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(ProtocolError::InvalidPayload("chat text must not be empty".into()));
                }
                if text.chars().count() > MAX_CHAT_LEN {
                    return Err(ProtocolError::InvalidPayload(format!(
                        "chat text longer than {MAX_CHAT_LEN} characters"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let event: Self = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

fn validate_time(time: f64) -> Result<(), ProtocolError> {
    if !time.is_finite() || time < 0.0 {
        return Err(ProtocolError::InvalidPayload(format!("invalid playback time {time}")));
    }
    Ok(())
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RoomCreated {
        room_id: String,
    },
    RoomStatus {
        room_id: String,
        exists: bool,
    },
    TimeSyncReply {
        client_time: u64,
        server_time: u64,
    },
    Joined {
        room_id: String,
        username: String,
    },
    JoinFailed {
        reason: String,
    },
    /// Stable-room snapshot for a joiner; the client derives elapsed playback
    /// from `lastServerTimestamp` and its clock offset.
    SyncSnapshot {
        state: PlaybackState,
    },
    /// Pause, seek to `time`, then report `seek_ready`
    SeekCommand {
        time: f64,
        is_playing: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Apply `state` at server time `executionTimestamp`
    CoordinatedExecute {
        state: PlaybackState,
        execution_timestamp: u64,
    },
    PresenceUpdate {
        usernames: Vec<String>,
    },
    ChatMessage {
        message: ChatMessage,
    },
    ChatHistory {
        messages: Vec<ChatMessage>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidPayload(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Malformed frame: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
