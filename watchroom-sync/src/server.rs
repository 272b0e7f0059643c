//! WebSocket room server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                               ┌── RoomStore ── KeyValueStore
//!            ├── Session ── SessionDispatcher ── RoomEngine      (memory | RocksDB)
//! Client B ──┘                                    │
//!                                                 └── RoomManager ── BroadcastGroup
//!                                                                       │
//!                                                        ┌──────────────┼──────────────┐
//!                                                        ▼              ▼              ▼
//!                                                     Client A       Client B       Client C
//! ```
//!
//! One task per connection. Each task owns its [`Session`], sends the
//! dispatcher's unicast replies directly and relays the room broadcast
//! channel once the session has joined. A background sweeper reclaims
//! expired room keys.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Frame, RoomManager};
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::{Dispatch, SessionDispatcher};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::room::{EngineTiming, RoomEngine};
use crate::session::Session;
use crate::storage::{Backend, KeyValueStore, MemoryBackend, RocksBackend, RoomStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Lead time between accepting a play/pause and executing it
    pub coordination_buffer_ms: u64,
    /// How long an empty room survives
    pub idle_ttl_secs: u64,
    /// Proposal gate window
    pub proposal_lock_ms: u64,
    /// Chat messages kept per room
    pub chat_history_limit: usize,
    /// Expired-key sweep period
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            coordination_buffer_ms: 300,
            idle_ttl_secs: 300,
            proposal_lock_ms: 1_000,
            chat_history_limit: 500,
            sweep_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `WATCHROOM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("WATCHROOM_BIND") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("WATCHROOM_DATA_DIR").filter(|d| !d.is_empty()) {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Some(ms) = parse_var(&lookup, "WATCHROOM_BUFFER_MS") {
            config.coordination_buffer_ms = ms;
        }
        if let Some(secs) = parse_var(&lookup, "WATCHROOM_IDLE_TTL_SECS") {
            config.idle_ttl_secs = secs;
        }
        config
    }

    fn timing(&self) -> EngineTiming {
        EngineTiming {
            coordination_buffer_ms: self.coordination_buffer_ms,
            proposal_window_ms: self.proposal_lock_ms,
        }
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a non-negative integer");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

/// The room server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<RoomEngine>,
    dispatcher: Arc<SessionDispatcher>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let backend: Box<dyn Backend> = match &config.storage_path {
            Some(path) => Box::new(RocksBackend::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Box::new(MemoryBackend::new()),
        };
        Ok(Self::assemble(config, backend, clock))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::assemble(
            ServerConfig::default(),
            Box::new(MemoryBackend::new()),
            Arc::new(SystemClock),
        )
    }

    fn assemble(config: ServerConfig, backend: Box<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        let kv = Arc::new(KeyValueStore::new(backend, clock.clone()));
        let rooms = RoomStore::new(kv, config.idle_ttl_secs * 1_000, config.chat_history_limit);
        let manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let engine = Arc::new(RoomEngine::new(rooms, manager, clock, config.timing()));
        Self {
            dispatcher: Arc::new(SessionDispatcher::new(engine.clone())),
            engine,
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.engine.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Room server listening on {}", self.config.bind_addr);

        let sweeper = self.spawn_sweeper();
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let dispatcher = self.dispatcher.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, dispatcher, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.sweep().await {
                    Ok(report) if report.purged_keys > 0 => {
                        log::info!(
                            "Sweep reclaimed {} keys, {} idle room locks",
                            report.purged_keys,
                            report.pruned_locks
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Sweep failed: {e}"),
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<SessionDispatcher>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = Session::new();
        let result = Self::session_loop(
            &mut ws_sender,
            &mut ws_receiver,
            &mut session,
            &dispatcher,
            &stats,
            addr,
        )
        .await;

        // Cleanup runs whatever ended the loop
        dispatcher.on_disconnect(&mut session).await;
        {
            let active_rooms = dispatcher.engine().manager().room_count().await;
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = active_rooms;
        }
        log::info!("Connection closed from {addr}");
        result
    }

    async fn session_loop(
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        session: &mut Session,
        dispatcher: &SessionDispatcher,
        stats: &RwLock<ServerStats>,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.as_str().len() as u64;
                            }

                            let dispatch = match ClientEvent::decode(text.as_str()) {
                                Ok(event) => dispatcher.dispatch(session, event).await,
                                Err(e) => {
                                    log::warn!("Rejected frame from {addr}: {e}");
                                    stats.write().await.rejected_frames += 1;
                                    Dispatch::reply(ServerEvent::error(e.to_string()))
                                }
                            };

                            for reply in &dispatch.replies {
                                send_event(ws_sender, reply).await?;
                            }
                            if let Some(rx) = dispatch.subscription {
                                broadcast_rx = Some(rx);
                            }
                            if dispatch.close {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            stats.write().await.rejected_frames += 1;
                            send_event(ws_sender, &ServerEvent::error("binary frames are not supported")).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing room broadcast
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not joined yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(frame) => {
                            ws_sender.send(Message::text(frame.to_string())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Session {} lagged by {n} room messages, resyncing", session.id());
                            if let Some(frame) = dispatcher.resync(session).await {
                                send_event(ws_sender, &frame).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.engine.manager().room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RoomEngine> {
        &self.engine
    }
}

async fn send_event(ws_sender: &mut WsSender, event: &ServerEvent) -> Result<(), BoxError> {
    let text = event.encode()?;
    ws_sender.send(Message::text(text)).await?;
    Ok(())
}
