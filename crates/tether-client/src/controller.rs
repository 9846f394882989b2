//! Connection lifecycle controller.
//!
//! Owns the state machine and composes the backoff policy, heartbeat,
//! correlator and router. All transitions happen under one lock; events are
//! emitted after it is released so subscribers may call back in.
//!
//! Every transport instance is tagged with a session number. Disconnecting or
//! starting a new attempt bumps the session, and anything reported by an older
//! transport is ignored, so at most one transport is ever live.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tether_proto::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::ClientConfig;
use crate::correlator::{PendingReply, ReplyMatcher, RequestCorrelator};
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::router::{EventRouter, EventStream, Routed, SubscriptionId, Topic};
use crate::state::{AtomicConnectionState, ConnectionState};
use crate::transport::{close_code, Connector, OutboundFrame, TransportEvent, TransportLink};
use crate::websocket::WebSocketConnector;

/// Client for one logical gateway connection.
///
/// Cheap to clone; clones share the connection. Subscriber callbacks should
/// not hold a clone, or the controller can never be dropped.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    backoff: BackoffPolicy,
    connector: Arc<dyn Connector>,
    state: AtomicConnectionState,
    correlator: RequestCorrelator,
    router: EventRouter,
    heartbeat: HeartbeatMonitor,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    session: u64,
    attempts: u32,
    intentional_close: bool,
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionController")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

impl ConnectionController {
    /// Create a controller that connects over WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Create a controller that opens transports through `connector`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let correlator = RequestCorrelator::new();
        Ok(Self {
            inner: Arc::new(Inner {
                backoff: config.backoff(),
                config,
                connector,
                state: AtomicConnectionState::new(ConnectionState::Idle),
                router: EventRouter::new(correlator.clone()),
                correlator,
                heartbeat: HeartbeatMonitor::new(),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Check if the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Consecutive failed reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lifecycle.lock().attempts
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Whether the heartbeat is currently running.
    #[must_use]
    pub fn heartbeat_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    /// Open the connection.
    ///
    /// No-op if already connecting or open. Re-enables reconnection after
    /// `disconnect()` or after reconnection gave up.
    ///
    /// # Errors
    ///
    /// Returns the transport error if this attempt failed. A retry has
    /// already been scheduled in that case.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let session = {
            let mut lc = self.inner.lifecycle.lock();
            let state = self.inner.state.load();
            if !state.can_connect() {
                debug!(%state, "connect ignored");
                return Ok(());
            }
            lc.intentional_close = false;
            lc.attempts = 0;
            if let Some(timer) = lc.reconnect_timer.take() {
                timer.abort();
            }
            lc.session += 1;
            self.inner.state.store(ConnectionState::Connecting);
            lc.session
        };

        info!(url = %self.inner.config.url, "connecting to gateway");
        self.inner.open_transport(session).await
    }

    /// Close the connection and stop reconnecting until the next `connect()`.
    ///
    /// Fails every pending request with [`ClientError::ConnectionClosed`].
    /// Starts the close handshake but does not wait for it.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let was_active = {
            let mut lc = inner.lifecycle.lock();
            lc.intentional_close = true;
            lc.session += 1;
            if let Some(timer) = lc.reconnect_timer.take() {
                timer.abort();
            }
            inner.heartbeat.stop();

            let previous = inner.state.load();
            inner.state.store(ConnectionState::Closing);
            if let Some(outbound) = lc.outbound.take() {
                let close = OutboundFrame::Close {
                    code: close_code::NORMAL,
                    reason: "client disconnect".to_string(),
                };
                if outbound.try_send(close).is_err() {
                    debug!("outbound queue full, dropping transport without close frame");
                }
            }
            if let Some(reader) = lc.reader.take() {
                reader.abort();
            }
            inner.state.store(ConnectionState::Closed);
            matches!(previous, ConnectionState::Open | ConnectionState::Connecting)
        };

        let rejected = inner.correlator.reject_all(&ClientError::ConnectionClosed);
        info!(rejected, "disconnected from gateway");
        if was_active {
            inner.router.emit(ClientEvent::Disconnected {
                code: close_code::NORMAL,
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Send an envelope without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] unless the connection is open.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let json = envelope.to_json()?;
        let outbound = self.inner.active_outbound().ok_or(ClientError::NotConnected)?;
        outbound
            .send(OutboundFrame::Text(json))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Send `envelope` as a request and wait for the correlated reply.
    ///
    /// A fresh correlation id is written to `payload.requestId`. `timeout`
    /// defaults to `requestTimeoutMs`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] if the connection is not open.
    /// - [`ClientError::RequestTimeout`] if no matching reply arrived in time.
    /// - [`ClientError::ConnectionClosed`] if the connection was closed meanwhile.
    /// - [`ClientError::Protocol`] if the payload is not a JSON object.
    pub async fn request(
        &self,
        envelope: Envelope,
        matcher: ReplyMatcher,
        timeout: Option<Duration>,
    ) -> Result<Envelope, ClientError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let request_id = RequestCorrelator::next_correlation_id();
        let envelope = envelope.with_request_id(request_id.clone())?;
        let json = envelope.to_json()?;

        let (outbound, pending) = self.inner.register_request(request_id, matcher, timeout)?;
        debug!(request_id = %pending.request_id(), kind = %envelope.kind, "sending request");

        pending
            .send_and_wait(async move {
                outbound
                    .send(OutboundFrame::Text(json))
                    .await
                    .map_err(|_| ClientError::NotConnected)
            })
            .await
    }

    /// Subscribe `callback` to `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(topic, callback)
    }

    /// Receive the given topics through a channel.
    ///
    /// Dropping the stream leaves its subscriptions registered; release them
    /// with [`ConnectionController::close_stream`].
    pub fn subscribe_channel<I>(&self, topics: I) -> EventStream
    where
        I: IntoIterator,
        I::Item: Into<Topic>,
    {
        self.inner.router.subscribe_channel(topics)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.router.unsubscribe(id)
    }

    /// Remove every subscription feeding `stream`.
    pub fn close_stream(&self, stream: EventStream) -> usize {
        self.inner.router.close_stream(stream)
    }
}

impl Inner {
    fn active_outbound(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        let lc = self.lifecycle.lock();
        if self.state.load() == ConnectionState::Open {
            lc.outbound.clone()
        } else {
            None
        }
    }

    /// Register a request against the open transport.
    ///
    /// Runs under the lifecycle lock, so it lands either before a
    /// `disconnect()` (and is rejected by it) or after (and sees the closed state).
    /// Registered before sending so a fast reply cannot slip past.
    fn register_request(
        &self,
        request_id: String,
        matcher: ReplyMatcher,
        timeout: Duration,
    ) -> Result<(mpsc::Sender<OutboundFrame>, PendingReply), ClientError> {
        let lc = self.lifecycle.lock();
        let outbound = match (&lc.outbound, self.state.load()) {
            (Some(outbound), ConnectionState::Open) => outbound.clone(),
            _ => return Err(ClientError::NotConnected),
        };
        let pending = self.correlator.register(request_id, matcher, timeout)?;
        Ok((outbound, pending))
    }

    fn is_current(&self, lc: &Lifecycle, session: u64) -> bool {
        lc.session == session
    }

    async fn open_transport(self: &Arc<Self>, session: u64) -> Result<(), ClientError> {
        match self.connector.connect(self.config.connect_target()).await {
            Ok(link) => self.on_transport_open(session, link),
            Err(err) => {
                warn!(error = %err, "failed to open transport");
                self.on_transport_error(session, err.clone());
                self.on_transport_close(session, close_code::ABNORMAL, err.to_string());
                Err(err)
            }
        }
    }

    fn on_transport_open(
        self: &Arc<Self>,
        session: u64,
        link: TransportLink,
    ) -> Result<(), ClientError> {
        let TransportLink { outbound, inbound } = link;
        {
            let mut lc = self.lifecycle.lock();
            if !self.is_current(&lc, session) || self.state.load() != ConnectionState::Connecting {
                debug!(session, "discarding transport opened for a superseded session");
                let _ = outbound.try_send(OutboundFrame::Close {
                    code: close_code::NORMAL,
                    reason: "superseded".to_string(),
                });
                return Err(ClientError::ConnectionClosed);
            }

            self.state.store(ConnectionState::Open);
            lc.attempts = 0;
            lc.outbound = Some(outbound.clone());

            let weak = Arc::downgrade(self);
            self.heartbeat.start(outbound, self.config.heartbeat(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.force_close(session, close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                }
            });
            lc.reader = Some(tokio::spawn(Self::read_loop(
                Arc::downgrade(self),
                session,
                inbound,
            )));
        }

        info!(session, "gateway connection open");
        self.router.emit(ClientEvent::Connected);
        Ok(())
    }

    async fn read_loop(
        weak: Weak<Self>,
        session: u64,
        mut inbound: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = inbound.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Text(raw) => inner.on_message(&raw),
                TransportEvent::Error(message) => {
                    inner.on_transport_error(session, ClientError::Transport(message));
                }
                TransportEvent::Closed { code, reason } => {
                    inner.on_transport_close(session, code, reason);
                    return;
                }
            }
        }

        if let Some(inner) = weak.upgrade() {
            inner.on_transport_close(
                session,
                close_code::ABNORMAL,
                "transport dropped".to_string(),
            );
        }
    }

    fn on_message(&self, raw: &str) {
        if let Routed::Broadcast { kind, .. } = self.router.on_message(raw) {
            if kind == tether_proto::PONG {
                self.heartbeat.pong_received();
            }
        }
    }

    fn on_transport_error(&self, session: u64, err: ClientError) {
        if !self.is_current(&self.lifecycle.lock(), session) {
            return;
        }
        warn!(error = %err, "transport error");
        self.router.emit(ClientEvent::Error(err));
    }

    fn on_transport_close(self: &Arc<Self>, session: u64, code: u16, reason: String) {
        let mut events = Vec::with_capacity(3);
        let mut gave_up = None;
        {
            let mut lc = self.lifecycle.lock();
            if !self.is_current(&lc, session) || self.state.load() == ConnectionState::Closed {
                debug!(session, code, "ignoring close of a superseded transport");
                return;
            }

            lc.outbound = None;
            lc.reader = None;
            self.heartbeat.stop();
            self.state.store(ConnectionState::Closed);
            info!(code, %reason, "gateway connection closed");
            events.push(ClientEvent::Disconnected { code, reason });

            if lc.intentional_close {
                // disconnect() owns this closure
            } else if self.backoff.should_retry(lc.attempts) {
                lc.attempts += 1;
                let attempt = lc.attempts;
                let delay = self.backoff.delay(attempt);
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                events.push(ClientEvent::Reconnecting { attempt, delay });
                lc.reconnect_timer = Some(self.schedule_reconnect(session, delay));
            } else {
                error!(attempts = lc.attempts, "giving up on gateway reconnection");
                gave_up = Some(lc.attempts);
            }
        }

        if let Some(attempts) = gave_up {
            let rejected = self.correlator.reject_all(&ClientError::ConnectionClosed);
            debug!(rejected, "rejected pending requests after giving up");
            events.push(ClientEvent::Error(ClientError::MaxAttemptsExceeded { attempts }));
        }

        for event in events {
            self.router.emit(event);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, session: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let next = {
                let mut lc = inner.lifecycle.lock();
                if !inner.is_current(&lc, session) || lc.intentional_close {
                    return;
                }
                lc.reconnect_timer = None;
                lc.session += 1;
                inner.state.store(ConnectionState::Connecting);
                lc.session
            };

            debug!(attempt = inner.lifecycle.lock().attempts, "reconnecting to gateway");
            // Failures are routed through on_transport_close, which schedules the next attempt.
            let _ = inner.open_transport(next).await;
        })
    }

    fn force_close(self: &Arc<Self>, session: u64, code: u16, reason: &str) {
        {
            let mut lc = self.lifecycle.lock();
            if !self.is_current(&lc, session) || self.state.load() != ConnectionState::Open {
                return;
            }
            if let Some(outbound) = lc.outbound.take() {
                let _ = outbound.try_send(OutboundFrame::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            if let Some(reader) = lc.reader.take() {
                reader.abort();
            }
        }
        self.on_transport_close(session, code, reason.to_string());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.heartbeat.stop();
        let lc = self.lifecycle.get_mut();
        if let Some(timer) = lc.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = lc.reader.take() {
            reader.abort();
        }
        if let Some(outbound) = lc.outbound.take() {
            let _ = outbound.try_send(OutboundFrame::Close {
                code: close_code::NORMAL,
                reason: "client dropped".to_string(),
            });
        }
    }
}
