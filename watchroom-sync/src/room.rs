//! Room playback state machine.
//!
//! ```text
//!               load_video / propose_seek
//!   ┌────────┐ ───────────────────────────► ┌─────────┐
//!   │ Stable │                              │ Seeking │ ◄─┐ load_video /
//!   └────────┘ ◄─────────────────────────── └─────────┘ ──┘ propose_seek
//!       ▲  │     barrier release            │
//!       └──┘     (all present ready)        │ propose_state
//!   propose_state ◄─────────────────────────┘
//! ```
//!
//! Every transition for a room runs under that room's async mutex, and the
//! resulting broadcast is sent before the mutex is released. Broadcast order
//! within a room is therefore transition order, and a barrier can't be
//! released twice by concurrent `seek_ready` / disconnect handlers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::barrier::{BarrierState, ReadinessBarrier};
use crate::broadcast::{Frame, RoomManager};
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::gate::{ProposalGate, DEFAULT_WINDOW_MS};
use crate::names::{avatar_for, random_display_name, SYSTEM_USER};
use crate::protocol::{ChatMessage, PlaybackState, RoomStatus, ServerEvent};
use crate::storage::RoomStore;

/// Delay between accepting a coordinated command and its execution instant.
pub const DEFAULT_COORDINATION_BUFFER_MS: u64 = 300;

/// Generated names tried before falling back to a disambiguated one.
const NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    pub coordination_buffer_ms: u64,
    pub proposal_window_ms: u64,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            coordination_buffer_ms: DEFAULT_COORDINATION_BUFFER_MS,
            proposal_window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

/// One async mutex per room id.
#[derive(Default)]
struct RoomLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    async fn acquire(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(room_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on.
    async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// What a successful join hands back to the session.
#[derive(Debug)]
pub struct JoinOutcome {
    pub username: String,
    /// Unicast frames for the joiner, in send order
    pub replies: Vec<ServerEvent>,
    /// Room broadcasts from this point on
    pub receiver: broadcast::Receiver<Frame>,
}

/// Result of a background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_keys: usize,
    pub pruned_locks: usize,
}

pub struct RoomEngine {
    rooms: RoomStore,
    gate: ProposalGate,
    barrier: ReadinessBarrier,
    manager: Arc<RoomManager>,
    clock: Arc<dyn Clock>,
    locks: RoomLocks,
    timing: EngineTiming,
}

impl RoomEngine {
    pub fn new(
        rooms: RoomStore,
        manager: Arc<RoomManager>,
        clock: Arc<dyn Clock>,
        timing: EngineTiming,
    ) -> Self {
        Self {
            gate: ProposalGate::new(rooms.clone(), timing.proposal_window_ms),
            barrier: ReadinessBarrier::new(rooms.clone()),
            rooms,
            manager,
            clock,
            locks: RoomLocks::default(),
            timing,
        }
    }

    pub fn rooms(&self) -> &RoomStore {
        &self.rooms
    }

    pub fn manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn timing(&self) -> EngineTiming {
        self.timing
    }

    // ─── Room lifecycle ───────────────────────────────────────────────

    /// Allocate a fresh room. It expires unless someone joins within the
    /// idle window.
    pub async fn create_room(&self) -> SyncResult<String> {
        let room_id = Uuid::new_v4().to_string();
        let _guard = self.locks.acquire(&room_id).await;
        self.rooms.create(&room_id, self.now_ms())?;
        log::info!("Room {room_id} created");
        Ok(room_id)
    }

    pub async fn room_exists(&self, room_id: &str) -> SyncResult<bool> {
        Ok(self.rooms.exists(room_id)?)
    }

    /// Current authoritative state.
    pub async fn state(&self, room_id: &str) -> SyncResult<PlaybackState> {
        self.require(room_id)
    }

    /// Reclaim expired keys and idle per-room locks.
    pub async fn sweep(&self) -> SyncResult<SweepReport> {
        let purged_keys = self.rooms.kv().purge_expired()?;
        let pruned_locks = self.locks.prune().await;
        if purged_keys > 0 {
            log::debug!("Sweep reclaimed {purged_keys} expired keys");
        }
        Ok(SweepReport {
            purged_keys,
            pruned_locks,
        })
    }

    /// Reset persisted rooms after a restart.
    ///
    /// Nobody is connected yet, so presence and readiness left behind by
    /// the previous process are stale. Each room keeps its playback state
    /// and chat, and starts its idle countdown.
    pub async fn recover(&self) -> SyncResult<usize> {
        let room_ids = self.rooms.room_ids()?;
        for room_id in &room_ids {
            let _guard = self.locks.acquire(room_id).await;
            self.rooms.clear_users(room_id)?;
            self.barrier.reset(room_id)?;
            self.rooms.arm_idle_ttl(room_id)?;
        }
        Ok(room_ids.len())
    }

    /// Number of rooms with a live serialization lock.
    pub async fn tracked_rooms(&self) -> usize {
        self.locks.len().await
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Add a participant and hand back what they need to catch up.
    ///
    /// An empty `requested` name is replaced by a generated one. The joiner
    /// is subscribed before the presence update goes out, so they see their
    /// own arrival.
    pub async fn join(&self, room_id: &str, requested: &str, session_id: Uuid) -> SyncResult<JoinOutcome> {
        let _guard = self.locks.acquire(room_id).await;
        // every read that can fail happens before the name is claimed
        let state = self.require(room_id)?;
        let history = self.rooms.chat_history(room_id)?;
        let username = self.claim_name(room_id, requested.trim(), session_id)?;

        match self.admit(room_id, &username, session_id).await {
            Ok(receiver) => {
                log::info!("{username} joined room {room_id}");
                Ok(JoinOutcome {
                    replies: vec![
                        ServerEvent::Joined {
                            room_id: room_id.to_string(),
                            username: username.clone(),
                        },
                        catch_up_frame(state),
                        ServerEvent::ChatHistory { messages: history },
                    ],
                    username,
                    receiver,
                })
            }
            Err(e) => {
                log::warn!("Join of {username} to room {room_id} failed, rolling back: {e}");
                self.abandon_join(room_id, &username, session_id).await;
                Err(e)
            }
        }
    }

    /// Steps after the name is claimed. Any failure here is undone by
    /// [`Self::abandon_join`].
    async fn admit(
        &self,
        room_id: &str,
        username: &str,
        session_id: Uuid,
    ) -> SyncResult<broadcast::Receiver<Frame>> {
        self.rooms.persist(room_id)?;
        let group = self.manager.get_or_create(room_id).await;
        let receiver = group.add_peer(session_id).await;
        self.broadcast_presence(room_id).await?;
        self.announce(room_id, format!("{username} joined the room")).await?;
        Ok(receiver)
    }

    /// Undo a half-finished join so no unbound name lingers in presence.
    async fn abandon_join(&self, room_id: &str, username: &str, session_id: Uuid) {
        if let Some(group) = self.manager.get(room_id).await {
            group.remove_peer(&session_id).await;
        }
        self.manager.remove_if_empty(room_id).await;

        if let Err(e) = self.forget_user(room_id, username).await {
            log::error!("Could not roll back join of {username} to room {room_id}: {e}");
        }
    }

    async fn forget_user(&self, room_id: &str, username: &str) -> SyncResult<()> {
        if !self.rooms.remove_user(room_id, username)? {
            return Ok(());
        }
        if self.rooms.user_count(room_id)? == 0 {
            self.rooms.arm_idle_ttl(room_id)?;
        }
        // others may already have seen the name in a presence update
        self.broadcast_presence(room_id).await
    }

    /// Frame that puts a session back in step with the room: the active
    /// seek episode while seeking, the authoritative state otherwise.
    ///
    /// Sent to a session whose broadcast receiver fell behind and skipped
    /// frames it can't do without.
    pub async fn catch_up(&self, room_id: &str) -> SyncResult<ServerEvent> {
        let _guard = self.locks.acquire(room_id).await;
        Ok(catch_up_frame(self.require(room_id)?))
    }

    fn claim_name(&self, room_id: &str, requested: &str, session_id: Uuid) -> SyncResult<String> {
        if !requested.is_empty() {
            if requested.eq_ignore_ascii_case(SYSTEM_USER) || !self.rooms.add_user(room_id, requested)? {
                return Err(SyncError::UsernameTaken(requested.to_string()));
            }
            return Ok(requested.to_string());
        }

        for _ in 0..NAME_ATTEMPTS {
            let name = random_display_name();
            if self.rooms.add_user(room_id, &name)? {
                return Ok(name);
            }
        }
        let suffix: String = session_id.simple().to_string().chars().take(4).collect();
        let name = format!("{} {suffix}", random_display_name());
        if self.rooms.add_user(room_id, &name)? {
            Ok(name)
        } else {
            Err(SyncError::UsernameTaken(name))
        }
    }

    /// Remove a participant after a disconnect or player fault.
    ///
    /// A departure can complete the barrier for everyone else. When the
    /// last participant leaves, the room starts its idle countdown. Leaving
    /// a room that already expired is a no-op.
    pub async fn leave(&self, room_id: &str, username: &str, session_id: Uuid) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        if let Some(group) = self.manager.get(room_id).await {
            group.remove_peer(&session_id).await;
        }

        let result = self.leave_locked(room_id, username).await;
        self.manager.remove_if_empty(room_id).await;
        result
    }

    async fn leave_locked(&self, room_id: &str, username: &str) -> SyncResult<()> {
        let Some(state) = self.rooms.load(room_id)? else {
            log::debug!("{username} left room {room_id}, which has already expired");
            return Ok(());
        };

        let was_present = self.rooms.remove_user(room_id, username)?;
        let barrier = self.barrier.withdraw(room_id, username)?;
        if state.status == RoomStatus::Seeking && barrier == BarrierState::Complete {
            log::info!("Departure of {username} completed the barrier in room {room_id}");
            self.release(room_id, state).await?;
        }

        if was_present {
            self.broadcast_presence(room_id).await?;
            self.announce(room_id, format!("{username} left the room")).await?;
            log::info!("{username} left room {room_id}");
        }

        if self.rooms.user_count(room_id)? == 0 {
            self.rooms.arm_idle_ttl(room_id)?;
            log::info!(
                "Room {room_id} is empty, expires in {}s",
                self.rooms.idle_ttl_ms() / 1_000
            );
        }
        Ok(())
    }

    pub async fn presence(&self, room_id: &str) -> SyncResult<Vec<String>> {
        Ok(self.rooms.users(room_id)?)
    }

    // ─── Playback transitions ─────────────────────────────────────────

    /// Switch the room to a new video and start a resynchronization
    /// episode at position 0.
    pub async fn load_video(&self, room_id: &str, url: &str) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        let mut state = self.require(room_id)?;
        state.video_url = url.trim().to_string();
        self.begin_episode(room_id, state, 0.0, true).await
    }

    /// Jump to `time` and start a resynchronization episode.
    pub async fn propose_seek(&self, room_id: &str, time: f64) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        let state = self.require(room_id)?;
        self.begin_episode(room_id, state, time, false).await
    }

    async fn begin_episode(
        &self,
        room_id: &str,
        mut state: PlaybackState,
        time: f64,
        with_url: bool,
    ) -> SyncResult<()> {
        state.current_time = time;
        state.is_playing = false;
        state.status = RoomStatus::Seeking;
        state.last_server_timestamp = self.now_ms();
        self.rooms.save(room_id, &state)?;
        self.barrier.reset(room_id)?;

        log::debug!("Room {room_id} seeking to {time}s");
        let command = ServerEvent::SeekCommand {
            time,
            is_playing: false,
            url: with_url.then(|| state.video_url.clone()),
        };
        self.manager.broadcast(room_id, &command).await?;
        Ok(())
    }

    /// Commit to playing or pausing at `time`, effective one coordination
    /// buffer from now.
    ///
    /// Returns [`SyncError::Suppressed`] when another proposal was accepted
    /// within the gate window; nothing is mutated or broadcast in that case.
    pub async fn propose_state(&self, room_id: &str, is_playing: bool, time: f64) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        let mut state = self.require(room_id)?;
        if !self.gate.try_admit(room_id)? {
            log::debug!("Proposal in room {room_id} suppressed by gate");
            return Err(SyncError::Suppressed);
        }

        state.is_playing = is_playing;
        state.current_time = time;
        self.commit(room_id, state).await
    }

    /// Record that `username` finished seeking. Ignored unless the room is
    /// mid-episode.
    pub async fn report_ready(&self, room_id: &str, username: &str) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        let state = self.require(room_id)?;
        if state.status != RoomStatus::Seeking {
            log::debug!("Late ready signal from {username} in stable room {room_id}");
            return Ok(());
        }

        match self.barrier.mark_ready(room_id, username)? {
            BarrierState::Complete => {
                log::info!("Barrier released in room {room_id}");
                self.release(room_id, state).await
            }
            BarrierState::Waiting { ready, members } => {
                log::debug!("Room {room_id}: {ready}/{members} ready");
                Ok(())
            }
            BarrierState::Empty => Ok(()),
        }
    }

    /// Resume playback for everyone at the current target position.
    async fn release(&self, room_id: &str, mut state: PlaybackState) -> SyncResult<()> {
        state.is_playing = true;
        self.commit(room_id, state).await
    }

    /// Return to `Stable` with a future execution instant and tell everyone,
    /// sender included.
    async fn commit(&self, room_id: &str, mut state: PlaybackState) -> SyncResult<()> {
        let execution_timestamp = self.now_ms() + self.timing.coordination_buffer_ms;
        state.status = RoomStatus::Stable;
        state.last_server_timestamp = execution_timestamp;
        self.rooms.save(room_id, &state)?;
        self.barrier.reset(room_id)?;

        self.manager
            .broadcast(
                room_id,
                &ServerEvent::CoordinatedExecute {
                    state,
                    execution_timestamp,
                },
            )
            .await?;
        Ok(())
    }

    // ─── Chat ─────────────────────────────────────────────────────────

    pub async fn chat_send(&self, room_id: &str, username: &str, text: &str) -> SyncResult<()> {
        let _guard = self.locks.acquire(room_id).await;
        if !self.rooms.exists(room_id)? {
            return Err(SyncError::NotFound(room_id.to_string()));
        }
        let message = self.chat_message(username, text.trim(), false);
        self.post(room_id, message).await
    }

    async fn announce(&self, room_id: &str, text: String) -> SyncResult<()> {
        let message = self.chat_message(SYSTEM_USER, &text, true);
        self.post(room_id, message).await
    }

    async fn post(&self, room_id: &str, message: ChatMessage) -> SyncResult<()> {
        self.rooms.append_chat(room_id, &message)?;
        self.manager
            .broadcast(room_id, &ServerEvent::ChatMessage { message })
            .await?;
        Ok(())
    }

    fn chat_message(&self, user: &str, text: &str, is_system: bool) -> ChatMessage {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.now_ms() as i64)
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_default();
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            user: user.to_string(),
            timestamp,
            avatar: avatar_for(user),
            is_system,
        }
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn require(&self, room_id: &str) -> SyncResult<PlaybackState> {
        self.rooms
            .load(room_id)?
            .ok_or_else(|| SyncError::NotFound(room_id.to_string()))
    }

    async fn broadcast_presence(&self, room_id: &str) -> SyncResult<()> {
        let usernames = self.rooms.users(room_id)?;
        self.manager
            .broadcast(room_id, &ServerEvent::PresenceUpdate { usernames })
            .await?;
        Ok(())
    }
}

fn catch_up_frame(state: PlaybackState) -> ServerEvent {
    match state.status {
        RoomStatus::Seeking => ServerEvent::SeekCommand {
            time: state.current_time,
            is_playing: false,
            url: Some(state.video_url.clone()).filter(|url| !url.is_empty()),
        },
        RoomStatus::Stable => ServerEvent::SyncSnapshot { state },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::room_store::chat_key;
    use crate::storage::KeyValueStore;
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        engine: RoomEngine,
        clock: Arc<ManualClock>,
        room: String,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let kv = Arc::new(KeyValueStore::in_memory(clock.clone()));
        let rooms = RoomStore::new(kv, 300_000, 500);
        let engine = RoomEngine::new(
            rooms,
            Arc::new(RoomManager::new(64)),
            clock.clone(),
            EngineTiming::default(),
        );
        let room = engine.create_room().await.unwrap();
        Harness { engine, clock, room }
    }

    async fn join(h: &Harness, name: &str) -> (Uuid, JoinOutcome) {
        let id = Uuid::new_v4();
        let outcome = h.engine.join(&h.room, name, id).await.unwrap();
        (id, outcome)
    }

    fn drain(rx: &mut broadcast::Receiver<Frame>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(ServerEvent::decode(&frame).unwrap());
        }
        events
    }

    fn executions(events: &[ServerEvent]) -> Vec<(PlaybackState, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::CoordinatedExecute {
                    state,
                    execution_timestamp,
                } => Some((state.clone(), *execution_timestamp)),
                _ => None,
            })
            .collect()
    }

    fn seek_commands(events: &[ServerEvent]) -> Vec<ServerEvent> {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::SeekCommand { .. }))
            .cloned()
            .collect()
    }

    fn assert_ready_within_present(h: &Harness) {
        let rooms = h.engine.rooms();
        let present = rooms.users(&h.room).unwrap();
        let ready = rooms.ready_users(&h.room).unwrap();
        assert!(ready.len() <= present.len());
        assert!(ready.iter().all(|name| present.contains(name)));
    }

    #[tokio::test]
    async fn test_join_unknown_room_is_not_found() {
        let h = harness().await;
        let err = h.engine.join("nope", "alice", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, SyncError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_join_stable_room_gets_snapshot() {
        let h = harness().await;
        let (_, mut alice) = join(&h, "alice").await;

        assert_eq!(alice.username, "alice");
        assert!(matches!(&alice.replies[0], ServerEvent::Joined { username, .. } if username == "alice"));
        assert!(matches!(&alice.replies[1], ServerEvent::SyncSnapshot { state } if state.status == RoomStatus::Stable));
        assert!(matches!(&alice.replies[2], ServerEvent::ChatHistory { messages } if messages.is_empty()));

        let events = drain(&mut alice.receiver);
        assert_eq!(
            events[0],
            ServerEvent::PresenceUpdate {
                usernames: vec!["alice".into()]
            }
        );
        assert!(matches!(&events[1], ServerEvent::ChatMessage { message }
            if message.is_system && message.user == SYSTEM_USER && message.text == "alice joined the room"));

        assert_eq!(h.engine.rooms().lifecycle_ttls(&h.room).unwrap(), [None; 4]);
    }

    #[tokio::test]
    async fn test_join_seeking_room_gets_seek_command() {
        let h = harness().await;
        let (_, _alice) = join(&h, "alice").await;
        h.engine.load_video(&h.room, "https://example.com/a.mp4").await.unwrap();
        h.engine.propose_seek(&h.room, 42.0).await.unwrap();

        let (_, bob) = join(&h, "bob").await;
        assert_eq!(
            bob.replies[1],
            ServerEvent::SeekCommand {
                time: 42.0,
                is_playing: false,
                url: Some("https://example.com/a.mp4".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let h = harness().await;
        let (_, _alice) = join(&h, "alice").await;
        let err = h.engine.join(&h.room, "alice", Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, SyncError::UsernameTaken("alice".into()));

        let err = h.engine.join(&h.room, "system", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::UsernameTaken(_)));
        assert_eq!(h.engine.presence(&h.room).await.unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_username_is_generated() {
        let h = harness().await;
        let (_, outcome) = join(&h, "  ").await;
        assert!(outcome.username.contains(' '));
        assert!(h.engine.rooms().is_user(&h.room, &outcome.username).unwrap());
    }

    #[tokio::test]
    async fn test_seek_barrier_two_participants() {
        let h = harness().await;
        let (_, mut a) = join(&h, "A").await;
        let (_, mut b) = join(&h, "B").await;
        h.engine.propose_state(&h.room, true, 10.0).await.unwrap();
        drain(&mut a.receiver);
        drain(&mut b.receiver);

        h.engine.propose_seek(&h.room, 42.0).await.unwrap();
        let state = h.engine.state(&h.room).await.unwrap();
        assert_eq!(state.status, RoomStatus::Seeking);
        assert!(!state.is_playing);
        assert_eq!(h.engine.rooms().ready_count(&h.room).unwrap(), 0);

        let expected_seek = ServerEvent::SeekCommand {
            time: 42.0,
            is_playing: false,
            url: None,
        };
        for rx in [&mut a.receiver, &mut b.receiver] {
            assert_eq!(seek_commands(&drain(rx)), vec![expected_seek.clone()]);
        }

        h.clock.advance(Duration::from_millis(50));
        h.engine.report_ready(&h.room, "B").await.unwrap();
        assert_eq!(h.engine.rooms().ready_users(&h.room).unwrap(), vec!["B".to_string()]);
        assert!(drain(&mut a.receiver).is_empty());

        let t = h.engine.now_ms();
        h.engine.report_ready(&h.room, "A").await.unwrap();
        for rx in [&mut a.receiver, &mut b.receiver] {
            let runs = executions(&drain(rx));
            assert_eq!(runs.len(), 1);
            let (state, at) = &runs[0];
            assert!(state.is_playing);
            assert_eq!(state.current_time, 42.0);
            assert_eq!(state.status, RoomStatus::Stable);
            assert_eq!(*at, t + 300);
            assert_eq!(state.last_server_timestamp, t + 300);
        }
        assert_eq!(h.engine.rooms().ready_count(&h.room).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_video_then_all_ready_executes_once() {
        let h = harness().await;
        let (_, mut a) = join(&h, "A").await;
        let (_, _b) = join(&h, "B").await;
        drain(&mut a.receiver);

        h.engine.load_video(&h.room, "X").await.unwrap();
        let seeks = seek_commands(&drain(&mut a.receiver));
        assert_eq!(
            seeks,
            vec![ServerEvent::SeekCommand {
                time: 0.0,
                is_playing: false,
                url: Some("X".into()),
            }]
        );

        h.engine.report_ready(&h.room, "A").await.unwrap();
        h.engine.report_ready(&h.room, "B").await.unwrap();
        // late duplicate for the exhausted episode
        h.engine.report_ready(&h.room, "B").await.unwrap();

        let runs = executions(&drain(&mut a.receiver));
        assert_eq!(runs.len(), 1);
        assert!(runs[0].0.is_playing);
        assert_eq!(runs[0].0.video_url, "X");
        assert_eq!(h.engine.rooms().ready_count(&h.room).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ready_ignored_while_stable() {
        let h = harness().await;
        let (_, mut a) = join(&h, "A").await;
        drain(&mut a.receiver);
        h.engine.report_ready(&h.room, "A").await.unwrap();
        assert!(drain(&mut a.receiver).is_empty());
        assert_eq!(h.engine.rooms().ready_count(&h.room).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_proposal_gate_admits_one_per_window() {
        let h = harness().await;
        let (_, mut a) = join(&h, "A").await;
        drain(&mut a.receiver);

        h.engine.propose_state(&h.room, true, 5.0).await.unwrap();
        let before = h.engine.state(&h.room).await.unwrap();

        h.clock.advance(Duration::from_millis(400));
        let err = h.engine.propose_state(&h.room, false, 9.0).await.unwrap_err();
        assert_eq!(err, SyncError::Suppressed);
        assert_eq!(h.engine.state(&h.room).await.unwrap(), before);
        assert_eq!(executions(&drain(&mut a.receiver)).len(), 1);

        h.clock.advance(Duration::from_millis(600));
        h.engine.propose_state(&h.room, false, 9.0).await.unwrap();
        let runs = executions(&drain(&mut a.receiver));
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].0.is_playing);
    }

    #[tokio::test]
    async fn test_propose_state_ends_episode() {
        let h = harness().await;
        let (_, _a) = join(&h, "A").await;
        let (_, _b) = join(&h, "B").await;
        h.engine.propose_seek(&h.room, 3.0).await.unwrap();
        h.engine.report_ready(&h.room, "A").await.unwrap();

        h.engine.propose_state(&h.room, false, 3.0).await.unwrap();
        let state = h.engine.state(&h.room).await.unwrap();
        assert_eq!(state.status, RoomStatus::Stable);
        assert_eq!(state.last_server_timestamp, T0 + 300);
        assert_eq!(h.engine.rooms().ready_count(&h.room).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_departure_completes_barrier() {
        let h = harness().await;
        let (_, mut a) = join(&h, "A").await;
        let (b_id, _b) = join(&h, "B").await;
        h.engine.propose_seek(&h.room, 12.0).await.unwrap();
        h.engine.report_ready(&h.room, "A").await.unwrap();
        drain(&mut a.receiver);

        h.engine.leave(&h.room, "B", b_id).await.unwrap();
        let events = drain(&mut a.receiver);
        let runs = executions(&events);
        assert_eq!(runs.len(), 1);
        assert!(runs[0].0.is_playing);
        assert_eq!(runs[0].0.current_time, 12.0);
        assert!(events.contains(&ServerEvent::PresenceUpdate {
            usernames: vec!["A".into()]
        }));
        assert_ready_within_present(&h);
    }

    #[tokio::test]
    async fn test_last_departure_mid_barrier_does_not_release() {
        let h = harness().await;
        let (a_id, _a) = join(&h, "A").await;
        h.engine.propose_seek(&h.room, 7.0).await.unwrap();
        h.engine.report_ready(&h.room, "A").await.unwrap();
        // single participant released already; start another episode
        h.engine.propose_seek(&h.room, 8.0).await.unwrap();

        h.engine.leave(&h.room, "A", a_id).await.unwrap();
        let state = h.engine.state(&h.room).await.unwrap();
        assert_eq!(state.status, RoomStatus::Seeking);
        assert!(!state.is_playing);
        assert_eq!(h.engine.rooms().user_count(&h.room).unwrap(), 0);

        let (_, b) = join(&h, "B").await;
        assert!(matches!(b.replies[1], ServerEvent::SeekCommand { time, .. } if time == 8.0));
    }

    #[tokio::test]
    async fn test_failed_join_leaves_presence_untouched() {
        let h = harness().await;
        let (a_id, _a) = join(&h, "A").await;

        // chat log replaced by a value of the wrong type
        let kv = h.engine.rooms().kv();
        let chat = chat_key(&h.room);
        kv.delete(&chat).unwrap();
        kv.hset_multiple(&chat, &[("bogus", "1".into())]).unwrap();

        let err = h.engine.join(&h.room, "B", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(h.engine.presence(&h.room).await.unwrap(), vec!["A".to_string()]);
        let group = h.engine.manager().get(&h.room).await.unwrap();
        assert_eq!(group.peer_count().await, 1);

        // the barrier still completes with A alone
        kv.delete(&chat).unwrap();
        kv.ensure_list(&chat).unwrap();
        h.engine.propose_seek(&h.room, 12.0).await.unwrap();
        h.engine.report_ready(&h.room, "A").await.unwrap();
        assert_eq!(h.engine.state(&h.room).await.unwrap().status, RoomStatus::Stable);

        h.engine.leave(&h.room, "A", a_id).await.unwrap();
        assert_eq!(
            h.engine.rooms().lifecycle_ttls(&h.room).unwrap(),
            [Some(300_000); 4]
        );
    }

    #[tokio::test]
    async fn test_abandoned_join_is_rolled_back() {
        let h = harness().await;
        let id = Uuid::new_v4();
        assert!(h.engine.rooms().add_user(&h.room, "ghost").unwrap());
        h.engine.rooms().persist(&h.room).unwrap();
        let _rx = h.engine.manager().get_or_create(&h.room).await.add_peer(id).await;

        h.engine.abandon_join(&h.room, "ghost", id).await;
        assert!(h.engine.presence(&h.room).await.unwrap().is_empty());
        assert!(h.engine.manager().get(&h.room).await.is_none());
        assert_eq!(
            h.engine.rooms().lifecycle_ttls(&h.room).unwrap(),
            [Some(300_000); 4]
        );
    }

    #[tokio::test]
    async fn test_catch_up_follows_status() {
        let h = harness().await;
        let (_a_id, _a) = join(&h, "A").await;
        assert!(matches!(
            h.engine.catch_up(&h.room).await.unwrap(),
            ServerEvent::SyncSnapshot { .. }
        ));

        h.engine.load_video(&h.room, "https://example.com/v.mp4").await.unwrap();
        assert_eq!(
            h.engine.catch_up(&h.room).await.unwrap(),
            ServerEvent::SeekCommand {
                time: 0.0,
                is_playing: false,
                url: Some("https://example.com/v.mp4".into()),
            }
        );
        assert_eq!(
            h.engine.catch_up("gone").await.unwrap_err(),
            SyncError::NotFound("gone".into())
        );
    }

    #[tokio::test]
    async fn test_last_leave_arms_idle_ttl_and_rejoin_clears_it() {
        let h = harness().await;
        let (a_id, _a) = join(&h, "A").await;
        h.engine.chat_send(&h.room, "A", "hi").await.unwrap();

        h.engine.leave(&h.room, "A", a_id).await.unwrap();
        assert_eq!(
            h.engine.rooms().lifecycle_ttls(&h.room).unwrap(),
            [Some(300_000); 4]
        );
        assert_eq!(h.engine.manager().room_count().await, 0);

        h.clock.advance(Duration::from_secs(299));
        let (_, again) = join(&h, "A").await;
        assert_eq!(h.engine.rooms().lifecycle_ttls(&h.room).unwrap(), [None; 4]);
        assert!(matches!(&again.replies[2], ServerEvent::ChatHistory { messages } if messages.len() == 3));
    }

    #[tokio::test]
    async fn test_room_expires_after_idle_window() {
        let h = harness().await;
        let (a_id, _a) = join(&h, "A").await;
        h.engine.leave(&h.room, "A", a_id).await.unwrap();

        h.clock.advance(Duration::from_secs(300));
        let report = h.engine.sweep().await.unwrap();
        assert_eq!(report.purged_keys, 4);
        assert_eq!(h.engine.tracked_rooms().await, 0);

        assert!(!h.engine.room_exists(&h.room).await.unwrap());
        assert_eq!(
            h.engine.report_ready(&h.room, "A").await.unwrap_err(),
            SyncError::NotFound(h.room.clone())
        );
        // late disconnect against an expired room is not an error
        h.engine.leave(&h.room, "A", a_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_clears_stale_presence() {
        let h = harness().await;
        let (_, _a) = join(&h, "A").await;
        h.engine.propose_seek(&h.room, 4.0).await.unwrap();

        assert_eq!(h.engine.recover().await.unwrap(), 1);
        assert_eq!(h.engine.rooms().user_count(&h.room).unwrap(), 0);
        assert_eq!(
            h.engine.rooms().lifecycle_ttls(&h.room).unwrap(),
            [Some(300_000); 4]
        );
        // state survives, the next joiner re-enters the episode
        let (_, b) = join(&h, "B").await;
        assert!(matches!(b.replies[1], ServerEvent::SeekCommand { time, .. } if time == 4.0));
    }

    #[tokio::test]
    async fn test_ready_never_exceeds_presence() {
        let h = harness().await;
        let (a_id, _a) = join(&h, "A").await;
        let (b_id, _b) = join(&h, "B").await;
        let (_c_id, _c) = join(&h, "C").await;
        h.engine.propose_seek(&h.room, 1.0).await.unwrap();
        assert_ready_within_present(&h);

        h.engine.report_ready(&h.room, "A").await.unwrap();
        assert_ready_within_present(&h);
        h.engine.report_ready(&h.room, "ghost").await.unwrap();
        assert_ready_within_present(&h);
        h.engine.leave(&h.room, "A", a_id).await.unwrap();
        assert_ready_within_present(&h);
        h.engine.report_ready(&h.room, "B").await.unwrap();
        assert_ready_within_present(&h);
        h.engine.leave(&h.room, "B", b_id).await.unwrap();
        assert_ready_within_present(&h);

        // C alone was never ready, B's departure leaves 0 of 1
        assert_eq!(h.engine.state(&h.room).await.unwrap().status, RoomStatus::Seeking);
        h.engine.report_ready(&h.room, "C").await.unwrap();
        assert_eq!(h.engine.state(&h.room).await.unwrap().status, RoomStatus::Stable);
    }

    #[tokio::test]
    async fn test_chat_send_broadcasts_and_persists() {
        let h = harness().await;
        let (_, mut a) = join(&h, "alice").await;
        drain(&mut a.receiver);

        h.engine.chat_send(&h.room, "alice", "  hello  ").await.unwrap();
        let events = drain(&mut a.receiver);
        let ServerEvent::ChatMessage { message } = &events[0] else {
            panic!("expected chat message, got {events:?}");
        };
        assert_eq!(message.text, "hello");
        assert_eq!(message.avatar, "A");
        assert!(!message.is_system);
        assert_eq!(message.timestamp.len(), 5);

        let history = h.engine.rooms().chat_history(&h.room).unwrap();
        assert_eq!(history.last(), Some(message));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let h = harness().await;
        let other = h.engine.create_room().await.unwrap();
        let (_, mut a) = join(&h, "A").await;
        let _b = h.engine.join(&other, "B", Uuid::new_v4()).await.unwrap();
        drain(&mut a.receiver);

        h.engine.propose_seek(&other, 5.0).await.unwrap();
        assert!(drain(&mut a.receiver).is_empty());
        assert_eq!(h.engine.state(&h.room).await.unwrap().status, RoomStatus::Stable);
    }

    #[tokio::test]
    async fn test_concurrent_ready_releases_once() {
        let h = Arc::new(harness().await);
        let mut names = Vec::new();
        let mut receiver = None;
        for i in 0..8 {
            let name = format!("user{i}");
            let (_, outcome) = join(&h, &name).await;
            if receiver.is_none() {
                receiver = Some(outcome.receiver);
            }
            names.push(name);
        }
        let mut rx = receiver.unwrap();
        h.engine.propose_seek(&h.room, 30.0).await.unwrap();
        drain(&mut rx);

        let handles: Vec<_> = names
            .into_iter()
            .map(|name| {
                let h = h.clone();
                tokio::spawn(async move { h.engine.report_ready(&h.room, &name).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(executions(&drain(&mut rx)).len(), 1);
    }
}
