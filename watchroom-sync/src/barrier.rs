//! Readiness barrier for a resynchronization episode.
//!
//! While a room is `Seeking`, every present participant must report
//! `seek_ready` before playback resumes. The barrier releases when the ready
//! count reaches the membership count, and membership is non-zero.
//!
//! Callers must hold the room's serialization lock across `mark_ready` /
//! `withdraw` and the release that follows, otherwise two concurrent signals
//! could both observe a full barrier.

use crate::storage::{RoomStore, StoreError};

/// Outcome of a barrier evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Waiting { ready: usize, members: usize },
    /// Everyone present is ready
    Complete,
    /// Nobody left in the room; nothing to release
    Empty,
}

/// Pure release rule.
pub fn evaluate(ready: usize, members: usize) -> BarrierState {
    if members == 0 {
        BarrierState::Empty
    } else if ready >= members {
        BarrierState::Complete
    } else {
        BarrierState::Waiting { ready, members }
    }
}

#[derive(Clone)]
pub struct ReadinessBarrier {
    rooms: RoomStore,
}

impl ReadinessBarrier {
    pub fn new(rooms: RoomStore) -> Self {
        Self { rooms }
    }

    /// Start a new episode: nobody is ready.
    pub fn reset(&self, room_id: &str) -> Result<(), StoreError> {
        self.rooms.clear_ready(room_id)
    }

    /// Record a ready signal. Signals from names not present in the room are
    /// ignored, which keeps ready ⊆ present.
    pub fn mark_ready(&self, room_id: &str, username: &str) -> Result<BarrierState, StoreError> {
        if self.rooms.is_user(room_id, username)? {
            self.rooms.add_ready(room_id, username)?;
        } else {
            log::debug!("Ignoring ready signal from {username}, not present in room {room_id}");
        }
        self.check(room_id)
    }

    /// Drop a departing participant from the episode and re-evaluate with
    /// the post-removal counts.
    pub fn withdraw(&self, room_id: &str, username: &str) -> Result<BarrierState, StoreError> {
        self.rooms.remove_ready(room_id, username)?;
        self.check(room_id)
    }

    pub fn check(&self, room_id: &str) -> Result<BarrierState, StoreError> {
        let ready = self.rooms.ready_count(room_id)?;
        let members = self.rooms.user_count(room_id)?;
        Ok(evaluate(ready, members))
    }
}
