//! Per-connection session state.

use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Room and display name a session joined as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_id: String,
    pub username: String,
}

/// One connected client. Lives exactly as long as its connection and is
/// never persisted.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    binding: Option<Binding>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            binding: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn bind(&mut self, room_id: impl Into<String>, username: impl Into<String>) {
        self.binding = Some(Binding {
            room_id: room_id.into(),
            username: username.into(),
        });
    }

    /// Detach from the room, returning what the session was bound to.
    pub fn unbind(&mut self) -> Option<Binding> {
        self.binding.take()
    }

    /// The binding, provided it targets `room_id`.
    pub fn binding_for(&self, room_id: &str) -> SyncResult<&Binding> {
        match &self.binding {
            None => Err(SyncError::NotJoined),
            Some(binding) if binding.room_id == room_id => Ok(binding),
            Some(binding) => Err(SyncError::WrongRoom {
                bound: binding.room_id.clone(),
                requested: room_id.to_string(),
            }),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
