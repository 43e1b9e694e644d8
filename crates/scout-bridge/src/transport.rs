//! # Transport Session
//!
//! WebSocket-carried pub/sub session with automatic reconnection, backoff,
//! and resubscription.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Transport Session States                            │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │              ConnAck ok      │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │               interrupted          │  timer expired            │
//! │        │                    │               │                           │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  RESUME RULE: after every reconnect the broker reports whether the     │
//! │  session (and its subscriptions) survived. If it did not, every        │
//! │  previously granted subscription is re-issued before normal traffic    │
//! │  resumes; a resubscribe failure is fatal for the whole session.        │
//! │                                                                         │
//! │  SUBSCRIBE ORDERING: subscribe() resolves only once the broker has     │
//! │  acknowledged, and hands back a SubscriptionGrant: the typed proof     │
//! │  that request-issuing components demand before publishing anything     │
//! │  that expects a response on that topic.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{DeliveryGuarantee, WireMessage};

/// The WebSocket stream type used by the session.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and acknowledged.
    Connected,
    /// Waiting before a reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the transport session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    /// Connection (and session handshake) timeout.
    pub connect_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,

    /// Keepalive ping interval.
    pub ping_interval: Duration,

    /// Deadline for handing a publish off to the session. A publish blocked
    /// longer than this is reported as a failure, not retried forever.
    pub publish_timeout: Duration,

    /// Deadline for re-establishing all subscriptions after a resume.
    pub resubscribe_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
            ping_interval: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            resubscribe_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Session Events
// =============================================================================

/// Events the session reports to its consumer (the agent).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An application message arrived on a subscribed topic.
    Delivery { topic: String, payload: Value },

    /// The connection dropped; the session is reconnecting on its own.
    Interrupted { reason: String },

    /// The connection was re-established. When `session_present` is false
    /// the transport has already re-issued every subscription.
    Resumed { session_present: bool },

    /// A subscription could not be re-established after a resume. Fatal.
    ResubscribeFailed { topic: String },
}

// =============================================================================
// Subscription Grant
// =============================================================================

/// Proof that a subscription was acknowledged by the broker.
///
/// Components that publish requests expecting a response on a topic take
/// the grant by reference, making subscribe-before-request a compile-time
/// precondition rather than a timing convention.
#[derive(Debug)]
pub struct SubscriptionGrant {
    topic: String,
}

impl SubscriptionGrant {
    pub(crate) fn assume(topic: &str) -> Self {
        SubscriptionGrant {
            topic: topic.to_string(),
        }
    }

    /// The granted topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

// =============================================================================
// Transport Commands (handle → task)
// =============================================================================

#[derive(Debug)]
pub(crate) enum TransportCommand {
    Subscribe {
        topic: String,
        qos: DeliveryGuarantee,
        reply: oneshot::Sender<BridgeResult<()>>,
    },
    Publish {
        topic: String,
        payload: Value,
        qos: DeliveryGuarantee,
    },
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the session from other components.
#[derive(Clone)]
pub struct TransportHandle {
    /// Sender for session commands.
    cmd_tx: mpsc::Sender<TransportCommand>,

    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,

    /// Shutdown signal.
    shutdown_tx: mpsc::Sender<()>,

    /// Deadline for handing off a publish.
    publish_timeout: Duration,
}

impl TransportHandle {
    /// Subscribes to a topic, blocking until the broker acknowledges.
    ///
    /// Resolves only after the `SubAck` arrives, so a returned grant means
    /// any message published to the topic afterwards will be delivered.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: DeliveryGuarantee,
    ) -> BridgeResult<SubscriptionGrant> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Subscribe {
                topic: topic.to_string(),
                qos,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::ChannelError("Transport is gone".into()))?;

        reply_rx
            .await
            .map_err(|_| BridgeError::ChannelError("Transport dropped subscribe reply".into()))??;

        Ok(SubscriptionGrant::assume(topic))
    }

    /// Publishes a message, waiting at most the configured hand-off deadline.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        qos: DeliveryGuarantee,
    ) -> BridgeResult<()> {
        let command = TransportCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos,
        };
        self.cmd_tx
            .send_timeout(command, self.publish_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => BridgeError::PublishTimeout {
                    topic: topic.to_string(),
                },
                SendTimeoutError::Closed(_) => {
                    BridgeError::ChannelError("Transport is gone".into())
                }
            })
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Returns true if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| BridgeError::ChannelError("Failed to send shutdown signal".into()))
    }

    /// Builds a handle wired to a bare command channel, for exercising
    /// components without a live session.
    #[cfg(test)]
    pub(crate) fn detached() -> (TransportHandle, mpsc::Receiver<TransportCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let handle = TransportHandle {
            cmd_tx,
            state: Arc::new(RwLock::new(ConnectionState::Connected)),
            shutdown_tx,
            publish_timeout: Duration::from_secs(1),
        };
        (handle, cmd_rx)
    }

    /// Overrides the observed connection state, for tests of components
    /// that gate on it.
    #[cfg(test)]
    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

// =============================================================================
// Transport Session
// =============================================================================

/// How a connection loop ended.
enum LoopEnd {
    /// Shutdown was requested; do not reconnect.
    Shutdown,
    /// The broker closed the connection; reconnect.
    RemoteClose,
}

/// Pub/sub transport session with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = TransportConfig {
///     url: "wss://broker.example/session".into(),
///     ..Default::default()
/// };
///
/// let (handle, mut events_rx) = Transport::spawn(config);
///
/// let grant = handle.subscribe("shadow/t/get/accepted", DeliveryGuarantee::AtLeastOnce).await?;
///
/// while let Some(event) = events_rx.recv().await {
///     // deliveries, interruptions, resumes
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state: Arc<RwLock<ConnectionState>>,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    shutdown_rx: mpsc::Receiver<()>,

    /// Subscriptions granted so far; replayed after a non-persisted resume.
    subscriptions: Vec<(String, DeliveryGuarantee)>,

    /// Subscribe calls awaiting their SubAck, keyed by topic.
    pending_subacks: HashMap<String, oneshot::Sender<BridgeResult<()>>>,
}

impl Transport {
    /// Creates a new session and spawns its background task.
    ///
    /// Returns a handle for publish/subscribe and a receiver for session
    /// events (deliveries, interruptions, resumes).
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(100);
        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let publish_timeout = config.publish_timeout;

        let transport = Transport {
            config,
            state: state.clone(),
            cmd_rx,
            events_tx,
            shutdown_rx,
            subscriptions: Vec::new(),
            pending_subacks: HashMap::new(),
        };

        // Spawn background task
        tokio::spawn(transport.run());

        let handle = TransportHandle {
            cmd_tx,
            state,
            shutdown_tx,
            publish_timeout,
        };

        (handle, events_rx)
    }

    /// Main session loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");

        let mut backoff = self.create_backoff();
        let mut retry_count = 0u32;
        let mut first_connection = true;

        'session: loop {
            // Check for shutdown
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Transport received shutdown signal");
                break;
            }

            *self.state.write().await = ConnectionState::Connecting;

            match self.connect_and_acknowledge().await {
                Ok((mut ws_stream, session_present)) => {
                    info!(session_present, "Session established");
                    backoff.reset();
                    retry_count = 0;

                    if first_connection {
                        first_connection = false;
                    } else {
                        self.emit(SessionEvent::Resumed { session_present }).await;
                        if !session_present {
                            info!(
                                count = self.subscriptions.len(),
                                "Session did not persist. Resubscribing to existing topics"
                            );
                            if let Err(e) = self.resubscribe(&mut ws_stream).await {
                                error!(?e, "Resubscription after resume failed");
                                if let BridgeError::ResubscribeFailed { topic } = &e {
                                    self.emit(SessionEvent::ResubscribeFailed {
                                        topic: topic.clone(),
                                    })
                                    .await;
                                }
                                break 'session;
                            }
                        }
                    }

                    *self.state.write().await = ConnectionState::Connected;

                    match self.connection_loop(ws_stream).await {
                        Ok(LoopEnd::Shutdown) => {
                            info!("Session closed on request");
                            break 'session;
                        }
                        Ok(LoopEnd::RemoteClose) => {
                            warn!("Broker closed the connection");
                            self.emit(SessionEvent::Interrupted {
                                reason: "connection closed by broker".into(),
                            })
                            .await;
                        }
                        Err(e) => {
                            warn!(?e, "Connection interrupted");
                            self.emit(SessionEvent::Interrupted {
                                reason: e.to_string(),
                            })
                            .await;
                        }
                    }
                }
                Err(e) => {
                    error!(?e, "Failed to connect");
                }
            }

            // Connection lost or failed - fail any waiters and enter backoff
            self.fail_pending_subacks();
            *self.state.write().await = ConnectionState::Backoff;

            // Check retry limit
            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(
                        max_retries = self.config.max_retries,
                        "Max reconnection attempts reached"
                    );
                    break;
                }
            }

            // Wait for backoff duration
            if let Some(duration) = backoff.next_backoff() {
                debug!(?duration, attempt = retry_count, "Waiting before reconnect");

                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        *self.state.write().await = ConnectionState::Reconnecting;
                    }
                    _ = self.shutdown_rx.recv() => {
                        info!("Shutdown during backoff");
                        break;
                    }
                }
            } else {
                // Backoff exhausted (shouldn't happen with infinite backoff)
                error!("Backoff exhausted");
                break;
            }
        }

        self.fail_pending_subacks();
        *self.state.write().await = ConnectionState::Disconnected;
        info!("Transport stopped");
    }

    /// Connects with timeout and waits for the broker's session
    /// acknowledgement. Returns the stream and whether the session persisted.
    async fn connect_and_acknowledge(&self) -> BridgeResult<(WsStream, bool)> {
        let connect_future = connect_async(self.config.url.as_str());

        let mut ws_stream = match timeout(self.config.connect_timeout, connect_future).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => return Err(BridgeError::from(e)),
            Err(_) => return Err(BridgeError::Timeout(self.config.connect_timeout.as_secs())),
        };

        // The broker speaks first: nothing is valid before its ConnAck.
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, ws_stream.next())
                .await
                .map_err(|_| {
                    BridgeError::HandshakeFailed("no session acknowledgement".into())
                })?;

            match frame {
                Some(Ok(WsMessage::Text(text))) => match WireMessage::from_json(&text) {
                    Ok(WireMessage::ConnAck(ack)) => {
                        return Ok((ws_stream, ack.session_present))
                    }
                    Ok(other) => {
                        return Err(BridgeError::HandshakeFailed(format!(
                            "expected ConnAck, got {}",
                            other.type_name()
                        )))
                    }
                    Err(e) => return Err(BridgeError::DeserializationFailed(e.to_string())),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    ws_stream.send(WsMessage::Pong(data)).await?;
                }
                Some(Ok(_)) => {
                    // Non-text noise before ConnAck, ignore
                }
                Some(Err(e)) => return Err(BridgeError::from(e)),
                None => return Err(BridgeError::Disconnected),
            }
        }
    }

    /// Re-issues every granted subscription and waits for all SubAcks.
    ///
    /// Deliveries arriving in the meantime are forwarded as usual. Any
    /// rejection, timeout, or connection loss is a fatal
    /// [`BridgeError::ResubscribeFailed`].
    async fn resubscribe(&mut self, ws_stream: &mut WsStream) -> BridgeResult<()> {
        let mut awaiting: Vec<String> = Vec::with_capacity(self.subscriptions.len());

        for (topic, qos) in &self.subscriptions {
            let frame = WireMessage::subscribe(topic, *qos);
            ws_stream
                .send(WsMessage::Text(frame.to_json()?.into()))
                .await?;
            awaiting.push(topic.clone());
        }

        let deadline = tokio::time::Instant::now() + self.config.resubscribe_timeout;

        while !awaiting.is_empty() {
            let frame = tokio::time::timeout_at(deadline, ws_stream.next())
                .await
                .map_err(|_| BridgeError::ResubscribeFailed {
                    topic: awaiting[0].clone(),
                })?;

            match frame {
                Some(Ok(WsMessage::Text(text))) => match WireMessage::from_json(&text) {
                    Ok(WireMessage::SubAck(ack)) => {
                        if !ack.granted {
                            return Err(BridgeError::ResubscribeFailed { topic: ack.topic });
                        }
                        debug!(topic = %ack.topic, "Resubscribed");
                        awaiting.retain(|t| t != &ack.topic);
                    }
                    Ok(WireMessage::Delivery(delivery)) => {
                        self.emit(SessionEvent::Delivery {
                            topic: delivery.topic,
                            payload: delivery.payload,
                        })
                        .await;
                    }
                    Ok(other) => {
                        debug!(frame = other.type_name(), "Ignoring frame during resubscribe");
                    }
                    Err(e) => {
                        warn!(?e, "Failed to parse frame during resubscribe");
                    }
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    ws_stream.send(WsMessage::Pong(data)).await?;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => {
                    return Err(BridgeError::ResubscribeFailed {
                        topic: awaiting[0].clone(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Main connection loop - handles commands, inbound frames, keepalive.
    async fn connection_loop(&mut self, ws_stream: WsStream) -> BridgeResult<LoopEnd> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_interval.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                // Handle outgoing commands
                Some(command) = self.cmd_rx.recv() => {
                    match command {
                        TransportCommand::Subscribe { topic, qos, reply } => {
                            let frame = WireMessage::subscribe(&topic, qos);
                            write.send(WsMessage::Text(frame.to_json()?.into())).await?;
                            debug!(topic = %topic, "Sent subscribe");
                            self.pending_subacks.insert(topic, reply);
                        }
                        TransportCommand::Publish { topic, payload, qos } => {
                            let frame = WireMessage::publish(&topic, payload, qos);
                            debug!(topic = %topic, "Publishing");
                            write.send(WsMessage::Text(frame.to_json()?.into())).await?;
                        }
                    }
                }

                // Handle incoming frames
                Some(result) = read.next() => {
                    match result {
                        Ok(WsMessage::Text(text)) => {
                            match WireMessage::from_json(&text) {
                                Ok(frame) => {
                                    if let Some(pong) = self.handle_frame(frame).await {
                                        write.send(WsMessage::Text(pong.to_json()?.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    warn!(?e, "Failed to parse frame");
                                }
                            }
                        }
                        Ok(WsMessage::Ping(data)) => {
                            write.send(WsMessage::Pong(data)).await?;
                        }
                        Ok(WsMessage::Pong(_)) => {
                            debug!("Received pong");
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(?frame, "Received close frame");
                            return Ok(LoopEnd::RemoteClose);
                        }
                        Ok(WsMessage::Binary(_)) => {
                            warn!("Received unexpected binary message");
                        }
                        Ok(WsMessage::Frame(_)) => {
                            // Raw frame, ignore
                        }
                        Err(e) => {
                            error!(?e, "WebSocket error");
                            return Err(BridgeError::from(e));
                        }
                    }
                }

                // Send periodic pings
                _ = ping_interval.tick() => {
                    let ping = WireMessage::Ping {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    };
                    write.send(WsMessage::Text(ping.to_json()?.into())).await?;
                    debug!("Sent ping");
                }

                // Check for shutdown
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(LoopEnd::Shutdown);
                }
            }
        }
    }

    /// Handles one parsed inbound frame. Returns a frame to send back, if any.
    async fn handle_frame(&mut self, frame: WireMessage) -> Option<WireMessage> {
        match frame {
            WireMessage::Delivery(delivery) => {
                debug!(topic = %delivery.topic, "Delivery");
                self.emit(SessionEvent::Delivery {
                    topic: delivery.topic,
                    payload: delivery.payload,
                })
                .await;
                None
            }
            WireMessage::SubAck(ack) => {
                match self.pending_subacks.remove(&ack.topic) {
                    Some(reply) => {
                        if ack.granted {
                            // Track for resubscription; a topic is only listed once.
                            if !self.subscriptions.iter().any(|(t, _)| t == &ack.topic) {
                                self.subscriptions
                                    .push((ack.topic.clone(), DeliveryGuarantee::AtLeastOnce));
                            }
                            info!(topic = %ack.topic, "Subscription granted");
                            let _ = reply.send(Ok(()));
                        } else {
                            warn!(topic = %ack.topic, "Subscription rejected");
                            let _ = reply.send(Err(BridgeError::SubscribeRejected {
                                topic: ack.topic,
                            }));
                        }
                    }
                    None => {
                        debug!(topic = %ack.topic, "SubAck with no waiter");
                    }
                }
                None
            }
            WireMessage::Ping { timestamp } => Some(WireMessage::Pong { timestamp }),
            WireMessage::Pong { .. } => {
                debug!("Received protocol pong");
                None
            }
            WireMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Broker error frame");
                None
            }
            other => {
                debug!(frame = other.type_name(), "Unhandled frame");
                None
            }
        }
    }

    /// Fails every subscribe call still waiting for a SubAck.
    fn fail_pending_subacks(&mut self) {
        for (topic, reply) in self.pending_subacks.drain() {
            debug!(topic = %topic, "Failing pending subscribe: disconnected");
            let _ = reply.send(Err(BridgeError::Disconnected));
        }
    }

    /// Forwards a session event to the consumer.
    async fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("Session event receiver dropped");
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }
}
