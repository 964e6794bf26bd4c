//! Connection Manager
//!
//! Owns one WebSocket transport at a time and drives the connection state
//! machine: connect with an open timeout, heartbeat-monitored session,
//! exponential-backoff reconnect, and a terminal failed state after the
//! retry budget is exhausted.
//!
//! # Single-writer event loop
//!
//! All state transitions, reconnect scheduling, and heartbeat handling run
//! inside one actor task; external callers talk to it through a command
//! channel and observe state through a watch channel. Timers are tied to the
//! session that created them (session-scoped cancellation token and event
//! channel), so a timer from a superseded connection can never fire into the
//! current one.
//!
//! # State machine
//!
//! | From | Event | To |
//! |---|---|---|
//! | Disconnected | `connect()` | Connecting |
//! | Connecting | transport opened | Connected |
//! | Connecting | open timeout | Failed |
//! | Connecting | transport error | Reconnecting, or Failed when exhausted |
//! | Connected | close code 1000 | Disconnected |
//! | Connected | abnormal close or heartbeat timeout | Reconnecting |
//! | Reconnecting | backoff elapsed | Connecting |
//! | Reconnecting | attempts exhausted | Failed |
//! | any | `disconnect()` | Disconnected |

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionRegistry;

use super::codec::{CodecError, JsonCodec};
use super::dispatcher::Dispatcher;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{HeartbeatPayload, SubscriptionRequest, WireMessage};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectAck = oneshot::Sender<Result<(), StreamError>>;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The transport did not open within the configured timeout.
    #[error("connection open timed out after {0:?}")]
    OpenTimeout(Duration),

    /// WebSocket transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The retry budget is exhausted; an explicit `connect()` is required.
    #[error("reconnect attempts exhausted after {0} attempts")]
    RetriesExhausted(u32),

    /// An explicit `disconnect()` aborted a pending connect.
    #[error("connect aborted by disconnect")]
    ConnectAborted,

    /// Codec failure on an outbound message.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The manager task is gone.
    #[error("connection manager channel closed")]
    ChannelClosed,
}

// =============================================================================
// State and Observers
// =============================================================================

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no pending reconnect.
    Disconnected,
    /// A transport open is in flight.
    Connecting,
    /// Transport open and heartbeat-monitored.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Retry budget exhausted; terminal until an explicit `connect()`.
    Failed,
}

impl ConnectionState {
    /// Stable lowercase name, used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle callbacks for external observers.
///
/// Invoked from inside the manager's event loop; implementations must be
/// infallible and quick. Errors never propagate across this boundary, they
/// arrive through [`StreamObserver::on_error`].
pub trait StreamObserver: Send + Sync {
    /// The transport is open and the subscription registry has been
    /// replayed. Guaranteed to fire only after resubscription completes.
    fn on_connect(&self) {}

    /// The transport closed. `code` is the WebSocket close code when one
    /// was received.
    fn on_disconnect(&self, code: Option<u16>, reason: &str) {
        let _ = (code, reason);
    }

    /// A transport, codec, or retry-budget error occurred.
    fn on_error(&self, error: &StreamError) {
        let _ = error;
    }

    /// A wire message was decoded (before dispatch).
    fn on_message(&self, message: &WireMessage) {
        let _ = message;
    }

    /// The connection state changed.
    fn on_state_change(&self, state: ConnectionState) {
        let _ = state;
    }
}

/// No-op observer for callers that only watch the state channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StreamObserver for NullObserver {}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket URL of the market data server.
    pub url: String,
    /// Reconnection backoff configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Maximum time for the transport open to complete.
    pub connection_timeout: Duration,
}

impl StreamConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connection_timeout: Duration::from_millis(10_000),
        }
    }
}

// =============================================================================
// Commands and Handle
// =============================================================================

enum Command {
    Connect(ConnectAck),
    Disconnect,
    Send(WireMessage),
}

/// Cloneable handle to the connection manager actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Connect and wait until the session is established (transport open and
    /// subscriptions replayed) or terminally failed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::OpenTimeout`] when the open times out,
    /// [`StreamError::RetriesExhausted`] when the retry budget runs out,
    /// [`StreamError::ConnectAborted`] when a `disconnect()` lands first,
    /// and [`StreamError::ChannelClosed`] when the manager is gone.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Connect(ack_tx))
            .await
            .map_err(|_| StreamError::ChannelClosed)?;
        ack_rx.await.map_err(|_| StreamError::ChannelClosed)?
    }

    /// Close the transport intentionally (close code 1000) or cancel a
    /// pending reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ChannelClosed`] when the manager is gone.
    pub async fn disconnect(&self) -> Result<(), StreamError> {
        self.command_tx
            .send(Command::Disconnect)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Queue an outbound wire message. Dropped with a warning when not
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ChannelClosed`] when the manager is gone.
    pub async fn send(&self, message: WireMessage) -> Result<(), StreamError> {
        self.command_tx
            .send(Command::Send(message))
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel of state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

// =============================================================================
// Manager Actor
// =============================================================================

enum SessionEnd {
    /// Closed by an explicit `disconnect()` (code 1000 sent).
    Intentional,
    /// Closed by the remote side or a transport/heartbeat failure.
    Remote {
        code: Option<u16>,
        reason: String,
    },
    /// Process shutdown.
    Shutdown,
}

/// The connection manager actor.
///
/// Spawn with [`ConnectionManager::spawn`]; interact through the returned
/// [`ConnectionHandle`].
pub struct ConnectionManager {
    config: StreamConfig,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    observer: Arc<dyn StreamObserver>,
    codec: JsonCodec,
    command_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the manager actor and return a handle to it.
    #[must_use]
    pub fn spawn(
        config: StreamConfig,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        observer: Arc<dyn StreamObserver>,
        cancel: CancellationToken,
    ) -> ConnectionHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            config,
            registry,
            dispatcher,
            observer,
            codec: JsonCodec::new(),
            command_rx,
            state_tx,
            cancel,
        };
        tokio::spawn(manager.run());

        ConnectionHandle {
            command_tx,
            state_rx,
        }
    }

    /// Actor loop: idle until a `connect()` arrives, then run one session
    /// (including its reconnect cycles) to completion.
    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                cmd = self.command_rx.recv() => match cmd {
                    None => break,
                    Some(Command::Connect(ack)) => self.run_session(vec![ack]).await,
                    Some(Command::Disconnect) => {
                        // Already disconnected or failed; idempotent.
                        self.set_state(ConnectionState::Disconnected);
                    }
                    Some(Command::Send(message)) => {
                        tracing::warn!(
                            tag = message.tag(),
                            "dropping outbound message while disconnected"
                        );
                    }
                },
            }
        }
        tracing::debug!("connection manager stopped");
    }

    /// One session: connect attempts, the connected loop, and reconnect
    /// cycles, until intentionally disconnected, terminally failed, or shut
    /// down.
    async fn run_session(&mut self, mut pending: Vec<ConnectAck>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(url = %self.config.url, "opening stream connection");

            let url = self.config.url.clone();
            let opening = tokio::time::timeout(
                self.config.connection_timeout,
                tokio_tungstenite::connect_async(url),
            );
            tokio::pin!(opening);

            // The in-flight open is abortable: a disconnect() issued while
            // Connecting takes effect immediately instead of waiting out the
            // open timeout.
            let outcome = loop {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    result = &mut opening => break result,
                    cmd = self.command_rx.recv() => match cmd {
                        None => return,
                        Some(Command::Disconnect) => {
                            self.set_state(ConnectionState::Disconnected);
                            for ack in pending.drain(..) {
                                let _ = ack.send(Err(StreamError::ConnectAborted));
                            }
                            return;
                        }
                        Some(Command::Connect(ack)) => pending.push(ack),
                        Some(Command::Send(message)) => {
                            tracing::warn!(
                                tag = message.tag(),
                                "dropping outbound message while connecting"
                            );
                        }
                    },
                }
            };

            match outcome {
                Err(_elapsed) => {
                    // Open timeout is terminal: the in-flight connect is
                    // rejected rather than silently retried.
                    tracing::error!(
                        timeout_ms = self.config.connection_timeout.as_millis(),
                        "connection open timed out"
                    );
                    self.set_state(ConnectionState::Failed);
                    self.observer
                        .on_error(&StreamError::OpenTimeout(self.config.connection_timeout));
                    for ack in pending.drain(..) {
                        let _ =
                            ack.send(Err(StreamError::OpenTimeout(self.config.connection_timeout)));
                    }
                    return;
                }
                Ok(Err(error)) => {
                    tracing::warn!(error = %error, "transport open failed");
                    self.observer
                        .on_error(&StreamError::Transport(error.to_string()));
                    if !self.backoff_or_fail(&mut policy, &mut pending).await {
                        return;
                    }
                }
                Ok(Ok((mut ws, _response))) => {
                    policy.reset();

                    // Resubscribe before the state flips to Connected, so
                    // neither the state channel, the connect() ack, nor
                    // on_connect can observe a session whose subscriptions
                    // are not yet re-established.
                    if let Err(error) = self.resubscribe(&mut ws).await {
                        tracing::warn!(error = %error, "resubscription failed");
                        self.observer.on_error(&error);
                        if !self.backoff_or_fail(&mut policy, &mut pending).await {
                            return;
                        }
                        continue;
                    }

                    self.set_state(ConnectionState::Connected);
                    for ack in pending.drain(..) {
                        let _ = ack.send(Ok(()));
                    }
                    self.observer.on_connect();

                    match self.connected_loop(&mut ws).await {
                        SessionEnd::Intentional => {
                            self.set_state(ConnectionState::Disconnected);
                            self.observer.on_disconnect(Some(1000), "client disconnect");
                            return;
                        }
                        SessionEnd::Remote { code, reason } => {
                            self.observer.on_disconnect(code, &reason);
                            if code == Some(1000) {
                                // Intentional close from the server side.
                                self.set_state(ConnectionState::Disconnected);
                                return;
                            }
                            tracing::warn!(?code, reason = %reason, "abnormal close");
                            if !self.backoff_or_fail(&mut policy, &mut pending).await {
                                return;
                            }
                        }
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            self.observer.on_disconnect(Some(1000), "shutdown");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Run the connected session until it ends.
    async fn connected_loop(&mut self, ws: &mut WsStream) -> SessionEnd {
        // Session-scoped heartbeat: its token and channel die with this
        // session, so stale timers cannot reach a successor connection.
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let session_cancel = self.cancel.child_token();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let heartbeat = HeartbeatManager::new(
            self.config.heartbeat.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            session_cancel.clone(),
        );
        let heartbeat_task = tokio::spawn(heartbeat.run());

        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "shutdown".into(),
                        }))
                        .await;
                    break SessionEnd::Shutdown;
                }
                cmd = self.command_rx.recv() => match cmd {
                    None => break SessionEnd::Shutdown,
                    Some(Command::Disconnect) => {
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnect".into(),
                            }))
                            .await;
                        break SessionEnd::Intentional;
                    }
                    Some(Command::Connect(ack)) => {
                        // Already connected.
                        let _ = ack.send(Ok(()));
                    }
                    Some(Command::Send(message)) => {
                        if let Err(error) = self.send_frame(ws, &message).await {
                            self.observer.on_error(&error);
                            break SessionEnd::Remote {
                                code: None,
                                reason: error.to_string(),
                            };
                        }
                    }
                },
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendPing) => {
                        let ping = WireMessage::Heartbeat(HeartbeatPayload::now());
                        if let Err(error) = self.send_frame(ws, &ping).await {
                            self.observer.on_error(&error);
                            break SessionEnd::Remote {
                                code: None,
                                reason: error.to_string(),
                            };
                        }
                    }
                    Some(HeartbeatEvent::Timeout) => {
                        // Force-close a silently-dead transport.
                        let _ = ws.close(None).await;
                        break SessionEnd::Remote {
                            code: None,
                            reason: "heartbeat timeout".to_string(),
                        };
                    }
                    None => {
                        tracing::debug!("heartbeat channel closed");
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat_state.record_inbound();
                        if let Some(reply) = self.handle_text(text.as_str()) {
                            if let Err(error) = self.send_frame(ws, &reply).await {
                                self.observer.on_error(&error);
                                break SessionEnd::Remote {
                                    code: None,
                                    reason: error.to_string(),
                                };
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat_state.record_inbound();
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {
                        heartbeat_state.record_inbound();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_default();
                        break SessionEnd::Remote { code, reason };
                    }
                    Some(Err(error)) => {
                        break SessionEnd::Remote {
                            code: None,
                            reason: error.to_string(),
                        };
                    }
                    None => {
                        break SessionEnd::Remote {
                            code: None,
                            reason: "transport stream ended".to_string(),
                        };
                    }
                },
            }
        };

        session_cancel.cancel();
        let _ = heartbeat_task.await;
        end
    }

    /// Decode and dispatch one inbound text frame; malformed or unknown
    /// frames are logged and dropped, never fatal.
    fn handle_text(&self, text: &str) -> Option<WireMessage> {
        match self.codec.decode(text) {
            Ok(message) => {
                self.observer.on_message(&message);
                self.dispatcher.dispatch(message)
            }
            Err(CodecError::UnknownMessageType(tag)) => {
                tracing::debug!(tag = %tag, "dropping frame with unknown type");
                None
            }
            Err(error) => {
                tracing::warn!(error = %error, "dropping undecodable frame");
                None
            }
        }
    }

    /// Replay the full subscription registry after a (re)connect.
    async fn resubscribe(&self, ws: &mut WsStream) -> Result<(), StreamError> {
        for (kind, symbols) in self.registry.replay_groups() {
            tracing::info!(
                kind = kind.as_str(),
                count = symbols.len(),
                "replaying subscriptions"
            );
            let request = WireMessage::Subscribe(SubscriptionRequest::new(symbols, kind));
            self.send_frame_raw(ws, &request).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, ws: &mut WsStream, message: &WireMessage) -> Result<(), StreamError> {
        self.send_frame_raw(ws, message).await
    }

    async fn send_frame_raw(
        &self,
        ws: &mut WsStream,
        message: &WireMessage,
    ) -> Result<(), StreamError> {
        let json = self.codec.encode(message)?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|error| StreamError::Transport(error.to_string()))
    }

    /// Schedule the next reconnect attempt, or enter `Failed` when the
    /// budget is exhausted. Returns `false` when the session should end.
    async fn backoff_or_fail(
        &mut self,
        policy: &mut ReconnectPolicy,
        pending: &mut Vec<ConnectAck>,
    ) -> bool {
        let Some(delay) = policy.next_delay() else {
            self.set_state(ConnectionState::Failed);
            let attempts = policy.attempt_count();
            tracing::error!(attempts, "reconnect attempts exhausted");
            self.observer
                .on_error(&StreamError::RetriesExhausted(attempts));
            for ack in pending.drain(..) {
                let _ = ack.send(Err(StreamError::RetriesExhausted(attempts)));
            }
            return false;
        };

        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(
            attempt = policy.attempt_count(),
            delay_ms = delay.as_millis(),
            "reconnecting after backoff"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        // The backoff sleep is cancellable: an explicit disconnect() lands
        // in Disconnected and must never be followed by a silent reconnect.
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                cmd = self.command_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::Disconnect) => {
                        self.set_state(ConnectionState::Disconnected);
                        for ack in pending.drain(..) {
                            let _ = ack.send(Err(StreamError::ConnectAborted));
                        }
                        return false;
                    }
                    Some(Command::Connect(ack)) => pending.push(ack),
                    Some(Command::Send(message)) => {
                        tracing::warn!(
                            tag = message.tag(),
                            "dropping outbound message while reconnecting"
                        );
                    }
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            tracing::info!(state = state.as_str(), "connection state changed");
            self.observer.on_state_change(state);
        }
    }
}
