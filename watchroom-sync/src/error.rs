//! Failure taxonomy for room event handling.
//!
//! Every kind is resolved at the session boundary by the dispatcher; none of
//! them crosses into another room.

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Room id unknown to the store (never created, or expired)
    NotFound(String),
    /// Proposal dropped by the proposal gate
    Suppressed,
    /// The client reported its own player as broken
    ClientFault(String),
    /// Display name already present in the room
    UsernameTaken(String),
    /// Room event from a session that has not joined
    NotJoined,
    /// Session tried to act on a room it is not bound to
    WrongRoom { bound: String, requested: String },
    /// Session tried to join while already bound to a room
    AlreadyJoined(String),
    Invalid(ProtocolError),
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(room) => write!(f, "Room not found: {room}"),
            Self::Suppressed => write!(f, "Proposal suppressed"),
            Self::ClientFault(msg) => write!(f, "Client player fault: {msg}"),
            Self::UsernameTaken(name) => write!(f, "Username already in use: {name}"),
            Self::NotJoined => write!(f, "Join a room first"),
            Self::WrongRoom { bound, requested } => {
                write!(f, "Session is bound to room {bound}, not {requested}")
            }
            Self::AlreadyJoined(room) => write!(f, "Already joined room {room}"),
            Self::Invalid(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Invalid(e)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
