//! WebSocket client for a watch room.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Typed senders for every room intent
//! - Clock calibration against the server via `time_sync` probes
//! - Translation of `executionTimestamp` into a local wait
//!
//! Time-sync replies are consumed internally by [`WatchClient::calibrate`];
//! every other server frame is surfaced as a [`WatchEvent`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::{
    schedule_delay, sleep_until_server_time, Clock, ClockOffsetEstimator, SystemClock,
    DEFAULT_PROBE_SAMPLES,
};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};

/// How long a single clock probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Connected,
    Disconnected,
    /// Any server frame other than a time-sync reply
    Server(ServerEvent),
}

/// Echo of one `time_sync` probe.
#[derive(Debug, Clone, Copy)]
struct ProbeReply {
    client_time: u64,
    server_time: u64,
}

pub struct WatchClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<dyn Clock>,
    estimator: ClockOffsetEstimator,
    /// Room passed to the last `join`
    room_id: Option<String>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<WatchEvent>,
    event_rx: Option<mpsc::Receiver<WatchEvent>>,
    probe_rx: Option<mpsc::Receiver<ProbeReply>>,
}

impl WatchClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_clock(server_url, Arc::new(SystemClock))
    }

    pub fn with_clock(server_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock,
            estimator: ClockOffsetEstimator::new(),
            room_id: None,
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            probe_rx: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: split probe replies from everything else
        let (probe_tx, probe_rx) = mpsc::channel::<ProbeReply>(16);
        self.probe_rx = Some(probe_rx);
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(ServerEvent::TimeSyncReply {
                            client_time,
                            server_time,
                        }) => {
                            let _ = probe_tx
                                .send(ProbeReply {
                                    client_time,
                                    server_time,
                                })
                                .await;
                        }
                        Ok(event) => {
                            let _ = event_tx.send(WatchEvent::Server(event)).await;
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(WatchEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(WatchEvent::Connected).await;
        Ok(())
    }

    /// Close the connection. The writer task sends a close frame once the
    /// outgoing queue drains.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        self.probe_rx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send any client frame.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let text = event.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(text).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn joined_room(&self) -> Result<String, ProtocolError> {
        self.room_id
            .clone()
            .ok_or_else(|| ProtocolError::InvalidPayload("join a room first".into()))
    }

    // ─── Room intents ─────────────────────────────────────────────────

    pub async fn create_room(&self) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CreateRoom).await
    }

    pub async fn check_room(&self, room_id: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CheckRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    /// Join `room_id`. An empty `username` asks the server for a generated
    /// name; the outcome arrives as `joined` or `join_failed`.
    pub async fn join(&mut self, room_id: &str, username: &str) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Join {
            room_id: room_id.to_string(),
            username: username.to_string(),
        })
        .await?;
        self.room_id = Some(room_id.to_string());
        Ok(())
    }

    pub async fn load_video(&self, url: &str) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::LoadVideo {
            room_id,
            url: url.to_string(),
        })
        .await
    }

    pub async fn propose_seek(&self, time: f64) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::ProposeSeek { room_id, time }).await
    }

    pub async fn propose_state(&self, is_playing: bool, time: f64) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::ProposeState {
            room_id,
            is_playing,
            time,
        })
        .await
    }

    pub async fn seek_ready(&self) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::SeekReady { room_id }).await
    }

    /// Report a broken local player. The server drops this session.
    pub async fn player_error(&self, message: &str) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::PlayerError {
            room_id,
            message: message.to_string(),
        })
        .await
    }

    pub async fn chat_send(&self, text: &str) -> Result<(), ProtocolError> {
        let room_id = self.joined_room()?;
        self.send(&ClientEvent::ChatSend {
            room_id,
            text: text.to_string(),
            username: String::new(),
        })
        .await
    }

    // ─── Clock ────────────────────────────────────────────────────────

    /// Estimate the clock offset with [`DEFAULT_PROBE_SAMPLES`] probes.
    pub async fn calibrate(&mut self) -> Result<f64, ProtocolError> {
        self.calibrate_with(DEFAULT_PROBE_SAMPLES).await
    }

    /// Probe the server `samples` times and return the averaged offset
    /// (server minus local) in milliseconds.
    pub async fn calibrate_with(&mut self, samples: usize) -> Result<f64, ProtocolError> {
        self.estimator.reset();
        for _ in 0..samples {
            let sent_at = self.clock.now_ms();
            self.send(&ClientEvent::TimeSync {
                client_time: sent_at,
            })
            .await?;

            let probe_rx = self.probe_rx.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
            let reply = tokio::time::timeout(PROBE_TIMEOUT, async {
                // skip echoes of earlier probes that timed out
                while let Some(reply) = probe_rx.recv().await {
                    if reply.client_time == sent_at {
                        return Some(reply);
                    }
                }
                None
            })
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .ok_or(ProtocolError::ConnectionClosed)?;

            let received_at = self.clock.now_ms();
            let offset = self
                .estimator
                .add_sample(reply.client_time, reply.server_time, received_at);
            log::trace!("Clock probe: offset {offset:.1}ms, rtt {}ms", received_at.saturating_sub(sent_at));
        }
        Ok(self.estimator.offset_ms())
    }

    pub fn offset_ms(&self) -> f64 {
        self.estimator.offset_ms()
    }

    /// Local delay until the server instant `execution_timestamp`, or
    /// `None` if it already passed.
    pub fn execution_delay(&self, execution_timestamp: u64) -> Option<Duration> {
        schedule_delay(execution_timestamp, self.clock.now_ms(), self.offset_ms())
    }

    /// Sleep until the server instant `execution_timestamp`.
    pub async fn wait_for_execution(&self, execution_timestamp: u64) {
        sleep_until_server_time(execution_timestamp, self.offset_ms(), self.clock.as_ref()).await;
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }
}
