//! Proposal gate: at most one accepted play/pause proposal per room per
//! window.
//!
//! Backed by a set-if-absent flag with a TTL. The flag is never deleted; it
//! expires on its own, so a crashed handler can't wedge the room. A rejected
//! proposal is dropped without feedback.

use crate::storage::{RoomStore, StoreError};

/// Default admission window.
pub const DEFAULT_WINDOW_MS: u64 = 1_000;

#[derive(Clone)]
pub struct ProposalGate {
    rooms: RoomStore,
    window_ms: u64,
}

impl ProposalGate {
    pub fn new(rooms: RoomStore, window_ms: u64) -> Self {
        Self { rooms, window_ms }
    }

    /// `true` if the proposal may proceed; arms the window as a side effect.
    pub fn try_admit(&self, room_id: &str) -> Result<bool, StoreError> {
        self.rooms.try_lock(room_id, self.window_ms)
    }

    /// Whether a proposal was admitted within the current window.
    pub fn is_closed(&self, room_id: &str) -> Result<bool, StoreError> {
        self.rooms.is_locked(room_id)
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}
