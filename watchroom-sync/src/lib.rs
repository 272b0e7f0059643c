//! # watchroom-sync: shared playback rooms over WebSocket
//!
//! Keeps every participant of a room playing the same video at the same
//! position. Any participant may load, seek, play or pause; the server
//! decides, and tells everyone when to apply the change.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ WatchClient │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌───────────────────┐
//! │ Clock offset│                     │ SessionDispatcher │
//! │ estimator   │                     └──────┬────────────┘
//! └─────────────┘                            ▼
//!                                     ┌─────────────┐  gate / barrier
//!                                     │ RoomEngine  │ ───────────────┐
//!                                     └──────┬──────┘                ▼
//!                                            │                 ┌───────────┐
//!                                     ┌──────┴────────┐        │ RoomStore │
//!                                     │ RoomManager   │        │ (TTL k/v) │
//!                                     │ (fan-out)     │        └───────────┘
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (`ClientEvent` / `ServerEvent`)
//! - [`clock`]: server clocks, client offset estimation and scheduling
//! - [`storage`]: key-value store with expiry, memory or RocksDB backed
//! - [`gate`]: one accepted play/pause proposal per room per window
//! - [`barrier`]: readiness barrier for resynchronization episodes
//! - [`room`]: the per-room playback state machine
//! - [`broadcast`]: room-scoped fan-out
//! - [`dispatcher`]: inbound event routing and error resolution
//! - [`server`]: WebSocket room server
//! - [`client`]: WebSocket room client

pub mod barrier;
pub mod broadcast;
pub mod client;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod names;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use barrier::{BarrierState, ReadinessBarrier};
pub use broadcast::{BroadcastGroup, RoomManager};
pub use client::{ConnectionState, WatchClient, WatchEvent};
pub use clock::{schedule_delay, Clock, ClockOffsetEstimator, ManualClock, SystemClock};
pub use dispatcher::{Dispatch, SessionDispatcher};
pub use error::{SyncError, SyncResult};
pub use gate::ProposalGate;
pub use protocol::{
    ChatMessage, ClientEvent, PlaybackState, ProtocolError, RoomStatus, ServerEvent,
};
pub use room::{EngineTiming, JoinOutcome, RoomEngine};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::Session;
pub use storage::{KeyValueStore, RoomStore, StoreConfig, StoreError};
