//! Director WebSocket connection lifecycle: connect, heartbeat,
//! reconnect-with-backoff, disconnect, and raw frame decode/dispatch.
//!
//! One `DirectorConnection` owns exactly one logical socket per session.
//! Decoded frames and lifecycle changes are surfaced as [`TransportEvent`]s
//! over an unbounded channel; the connection never interprets session
//! semantics itself.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use director_proto::{
    ClientFrame, ServerFrame, UserMessageData, decode_server_frame, encode_client_frame,
    PING_FRAME, PONG_FRAME,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::SyncTuning;

/// Resolved identity required before a socket may open. Both fields are
/// immutable for the socket's lifetime and travel as query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted, or the first handshake never succeeded.
    Failed,
}

#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Frame {
        frame: ServerFrame,
        /// Local receipt stamp, used downstream when server timestamps
        /// collide or omit a timezone.
        received_at: DateTime<Utc>,
    },
    ConnectionError(String),
    /// Terminal: the caller must surface a persistent connection-lost state.
    RetriesExhausted,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid director url: {0}")]
    InvalidUrl(String),
}

/// Optional attachment context carried alongside a user message.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub store_name: Option<String>,
    pub file_count: Option<u32>,
}

pub struct DirectorConnection {
    endpoint: Url,
    tuning: SyncTuning,
    events: mpsc::UnboundedSender<TransportEvent>,
    identity: Mutex<Option<SessionIdentity>>,
    state: Mutex<ConnectionState>,
    connect_in_flight: AtomicBool,
    ever_connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    socket_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl DirectorConnection {
    pub fn new(
        director_url: &str,
        tuning: SyncTuning,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let endpoint = Url::parse(director_url)
            .map_err(|err| TransportError::InvalidUrl(format!("{director_url}: {err}")))?;
        Ok(Self {
            endpoint,
            tuning,
            events,
            identity: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            connect_in_flight: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            outbound: Mutex::new(None),
            socket_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            reconnect_timer: Mutex::new(None),
        })
    }

    pub fn set_identity(&self, identity: SessionIdentity) {
        *self.identity.lock().unwrap() = Some(identity);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Open the socket. No-op while another attempt is in flight or a socket
    /// is already open, and a silent no-op when identity is unresolved (a
    /// recoverable precondition, not an error).
    pub async fn connect(self: &Arc<Self>) {
        let identity = match self.identity.lock().unwrap().clone() {
            Some(identity) => identity,
            None => {
                debug!("connect requested before identity resolved");
                return;
            }
        };
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            debug!("connect already in flight");
            return;
        }
        {
            let state = *self.state.lock().unwrap();
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                self.connect_in_flight.store(false, Ordering::SeqCst);
                return;
            }
        }
        self.set_state(ConnectionState::Connecting);

        let url = self.session_url(&identity);
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.ever_connected.store(true, Ordering::SeqCst);

                let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
                *self.outbound.lock().unwrap() = Some(out_tx.clone());

                let conn = Arc::clone(self);
                let socket = tokio::spawn(async move {
                    conn.run_socket(stream, out_rx).await;
                });
                if let Some(old) = self.socket_task.lock().unwrap().replace(socket) {
                    old.abort();
                }
                self.start_heartbeat(out_tx);
                self.set_state(ConnectionState::Connected);
                self.connect_in_flight.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                self.connect_in_flight.store(false, Ordering::SeqCst);
                self.emit(TransportEvent::ConnectionError(err.to_string()));
                if self.ever_connected.load(Ordering::SeqCst) {
                    self.schedule_reconnect();
                } else {
                    // A handshake that never succeeded points at
                    // configuration or auth, not a transient blip.
                    warn!(error = %err, "initial director handshake failed");
                    self.set_state(ConnectionState::Failed);
                }
            }
        }
    }

    /// Explicit teardown: cancels timers, closes the socket, and resets all
    /// lifecycle flags so a later `connect()` starts clean.
    pub async fn disconnect(&self) {
        if let Some(timer) = self.reconnect_timer.lock().unwrap().take() {
            timer.abort();
        }
        self.stop_heartbeat();
        *self.outbound.lock().unwrap() = None;
        let task = self.socket_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.connect_in_flight.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.ever_connected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Serialize and send a user message. Returns `false` (logged, never a
    /// panic or error) when the socket is not open.
    pub fn send_user_message(&self, text: &str, context: Option<MessageContext>) -> bool {
        if !self.is_connected() {
            debug!("dropping user message: socket not open");
            return false;
        }
        let Some(tx) = self.outbound.lock().unwrap().clone() else {
            return false;
        };
        let mut data = UserMessageData::text(text);
        if let Some(context) = context {
            data.store_name = context.store_name;
            data.file_count = context.file_count;
        }
        match encode_client_frame(&ClientFrame::UserMessage { data }) {
            Ok(json) => tx.send(Message::Text(json)).is_ok(),
            Err(err) => {
                warn!(error = %err, "failed to encode user message");
                false
            }
        }
    }

    fn session_url(&self, identity: &SessionIdentity) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("session_id", &identity.session_id)
            .append_pair("user_id", &identity.user_id);
        url
    }

    async fn run_socket(
        self: Arc<Self>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        // The close path owns lifecycle; errors only surface.
                        self.emit(TransportEvent::ConnectionError(err.to_string()));
                    }
                },
            }
        }
        self.handle_closed();
    }

    fn handle_text(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed == PONG_FRAME {
            trace!("heartbeat ack");
            return;
        }
        match decode_server_frame(trimmed) {
            Ok(frame) => self.emit(TransportEvent::Frame {
                frame,
                received_at: Utc::now(),
            }),
            Err(err) => warn!(error = %err, "dropping malformed frame"),
        }
    }

    fn handle_closed(self: &Arc<Self>) {
        self.stop_heartbeat();
        *self.outbound.lock().unwrap() = None;
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.tuning.auto_reconnect || !self.ever_connected.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.tuning.max_reconnect_attempts {
            self.set_state(ConnectionState::Failed);
            self.emit(TransportEvent::RetriesExhausted);
            return;
        }
        let delay = backoff_delay(&self.tuning, attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.set_state(ConnectionState::Reconnecting);
        let conn = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            conn.connect().await;
        });
        if let Some(old) = self.reconnect_timer.lock().unwrap().replace(timer) {
            old.abort();
        }
    }

    fn start_heartbeat(&self, tx: mpsc::UnboundedSender<Message>) {
        let period = self.tuning.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if tx.send(Message::Text(PING_FRAME.to_string())).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.heartbeat_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            *state = next;
            drop(state);
            self.emit(TransportEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// `base * 2^(attempt-1)`, clamped to the configured ceiling.
fn backoff_delay(tuning: &SyncTuning, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    tuning
        .reconnect_base_delay
        .saturating_mul(1u32 << exponent)
        .min(tuning.reconnect_max_delay)
}
