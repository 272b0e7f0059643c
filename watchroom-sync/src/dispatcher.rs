//! Routes inbound client events to room transitions.
//!
//! ```text
//! create_room    → RoomEngine::create_room      → room_created
//! check_room     → RoomEngine::room_exists      → room_status
//! time_sync      → clock echo                   → time_sync_reply
//! join           → RoomEngine::join             → joined, snapshot|seek, history
//! load_video     → RoomEngine::load_video       ⇒ seek_command (room)
//! propose_seek   → RoomEngine::propose_seek     ⇒ seek_command (room)
//! propose_state  → RoomEngine::propose_state    ⇒ coordinated_execute (room)
//! seek_ready     → RoomEngine::report_ready     ⇒ coordinated_execute on release
//! player_error   → RoomEngine::leave, then close the session
//! chat_send      → RoomEngine::chat_send        ⇒ chat_message (room)
//! ```
//!
//! Failures are resolved here and never leave the session:
//! unknown rooms and taken names become `join_failed`, suppressed proposals
//! vanish, everything else is reported back as an `error` frame.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::broadcast::Frame;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::room::RoomEngine;
use crate::session::Session;

/// What the connection task must do after an event.
#[derive(Default)]
pub struct Dispatch {
    /// Unicast frames, in send order
    pub replies: Vec<ServerEvent>,
    /// Room subscription handed out by a successful join
    pub subscription: Option<broadcast::Receiver<Frame>>,
    /// Close the connection after sending `replies`
    pub close: bool,
}

impl Dispatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(event: ServerEvent) -> Self {
        Self {
            replies: vec![event],
            ..Self::default()
        }
    }
}

pub struct SessionDispatcher {
    engine: Arc<RoomEngine>,
}

impl SessionDispatcher {
    pub fn new(engine: Arc<RoomEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<RoomEngine> {
        &self.engine
    }

    pub async fn dispatch(&self, session: &mut Session, event: ClientEvent) -> Dispatch {
        log::debug!("Session {} → {}", session.id(), event.kind());
        match self.route(session, event).await {
            Ok(dispatch) => dispatch,
            Err(e) => self.resolve(session, e).await,
        }
    }

    async fn route(&self, session: &mut Session, event: ClientEvent) -> SyncResult<Dispatch> {
        match event {
            ClientEvent::CreateRoom => {
                let room_id = self.engine.create_room().await?;
                Ok(Dispatch::reply(ServerEvent::RoomCreated { room_id }))
            }
            ClientEvent::CheckRoom { room_id } => {
                let exists = self.engine.room_exists(&room_id).await?;
                Ok(Dispatch::reply(ServerEvent::RoomStatus { room_id, exists }))
            }
            ClientEvent::TimeSync { client_time } => {
                let server_time = self.engine.now_ms();
                log::trace!("Time probe from {}: client {client_time}, server {server_time}", session.id());
                Ok(Dispatch::reply(ServerEvent::TimeSyncReply {
                    client_time,
                    server_time,
                }))
            }
            ClientEvent::Join { room_id, username } => {
                if let Some(binding) = session.binding() {
                    return Err(SyncError::AlreadyJoined(binding.room_id.clone()));
                }
                let outcome = self.engine.join(&room_id, &username, session.id()).await?;
                session.bind(room_id, outcome.username);
                Ok(Dispatch {
                    replies: outcome.replies,
                    subscription: Some(outcome.receiver),
                    close: false,
                })
            }
            ClientEvent::LoadVideo { room_id, url } => {
                session.binding_for(&room_id)?;
                self.engine.load_video(&room_id, &url).await?;
                Ok(Dispatch::none())
            }
            ClientEvent::ProposeSeek { room_id, time } => {
                session.binding_for(&room_id)?;
                self.engine.propose_seek(&room_id, time).await?;
                Ok(Dispatch::none())
            }
            ClientEvent::ProposeState {
                room_id,
                is_playing,
                time,
            } => {
                session.binding_for(&room_id)?;
                self.engine.propose_state(&room_id, is_playing, time).await?;
                Ok(Dispatch::none())
            }
            ClientEvent::SeekReady { room_id } => {
                let binding = session.binding_for(&room_id)?;
                self.engine.report_ready(&room_id, &binding.username).await?;
                Ok(Dispatch::none())
            }
            ClientEvent::PlayerError { room_id, message } => {
                // the session is dropped whether or not it ever joined
                log::debug!("Player fault from session {} for room {room_id}", session.id());
                Err(SyncError::ClientFault(message))
            }
            ClientEvent::ChatSend { room_id, text, .. } => {
                // the bound name is authoritative, not the one in the payload
                let binding = session.binding_for(&room_id)?;
                self.engine.chat_send(&room_id, &binding.username, &text).await?;
                Ok(Dispatch::none())
            }
        }
    }

    async fn resolve(&self, session: &mut Session, error: SyncError) -> Dispatch {
        match error {
            SyncError::Suppressed => Dispatch::none(),
            SyncError::NotFound(room_id) => {
                log::info!("Session {} asked for unknown room {room_id}", session.id());
                Dispatch::reply(ServerEvent::JoinFailed {
                    reason: "room not found".into(),
                })
            }
            SyncError::UsernameTaken(name) => {
                log::info!("Session {} tried taken name {name}", session.id());
                Dispatch::reply(ServerEvent::JoinFailed {
                    reason: "username already in use".into(),
                })
            }
            SyncError::ClientFault(message) => {
                log::warn!("Session {} reported a player fault: {message}", session.id());
                self.on_disconnect(session).await;
                Dispatch {
                    close: true,
                    ..Dispatch::default()
                }
            }
            SyncError::Store(e) => {
                log::error!("Store failure for session {}: {e}", session.id());
                Dispatch::reply(ServerEvent::error("room temporarily unavailable"))
            }
            other => Dispatch::reply(ServerEvent::error(other.to_string())),
        }
    }

    /// Frame that repairs a session whose room subscription dropped frames.
    ///
    /// A skipped `seek_command` would leave the room's barrier waiting on
    /// this session forever, and a skipped `coordinated_execute` would
    /// leave it out of step, so the current room state is re-sent.
    pub async fn resync(&self, session: &Session) -> Option<ServerEvent> {
        let binding = session.binding()?;
        match self.engine.catch_up(&binding.room_id).await {
            Ok(frame) => Some(frame),
            Err(SyncError::NotFound(_)) => None,
            Err(e) => {
                log::error!("Could not resync session {} in room {}: {e}", session.id(), binding.room_id);
                None
            }
        }
    }

    /// Run departure cleanup for a bound session. Safe to call twice.
    pub async fn on_disconnect(&self, session: &mut Session) {
        let Some(binding) = session.unbind() else {
            return;
        };
        if let Err(e) = self
            .engine
            .leave(&binding.room_id, &binding.username, session.id())
            .await
        {
            log::error!(
                "Cleanup for {} in room {} failed: {e}",
                binding.username,
                binding.room_id
            );
        }
    }
}
