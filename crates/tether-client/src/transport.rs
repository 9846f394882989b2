//! Duplex transport seam.
//!
//! The controller never touches sockets directly. A [`Connector`] opens a
//! [`TransportLink`]: a pair of channels carrying outbound frames to the
//! transport and inbound events from it. [`crate::websocket::WebSocketConnector`]
//! is the production implementation; [`memory`] provides an in-process one.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Close codes used by the client.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// No close frame was received (dropped connection or failed open).
    pub const ABNORMAL: u16 = 1006;
    /// The client closed the transport because heartbeats went unanswered.
    pub const HEARTBEAT_TIMEOUT: u16 = 4000;
}

/// Where and how to open a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Gateway URL.
    pub url: String,
    /// Bearer token presented when opening, if any.
    pub auth_token: Option<String>,
    /// Upper bound on a single open attempt.
    pub connect_timeout: Duration,
    /// Capacity of the link channels.
    pub buffer: usize,
}

/// Frame sent from the client to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A text frame holding one JSON envelope.
    Text(String),
    /// Start the close handshake.
    Close {
        /// Close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Event reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Text(String),
    /// The transport reported an error. A `Closed` event follows if the error was fatal.
    Error(String),
    /// The transport is closed. No further events follow.
    Closed {
        /// Close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// An open transport.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to write.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Events read.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens transports to a gateway.
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the transport could not be opened.
    fn connect(&self, target: ConnectTarget) -> BoxFuture<'_, Result<TransportLink, ClientError>>;
}

pub mod memory {
    //! In-process transport.
    //!
    //! [`MemoryConnector`] hands every successful open to a [`MemoryGateway`],
    //! which plays the remote side through [`MemoryPeer`]s.

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use futures::future::BoxFuture;
    use tether_proto::Envelope;
    use tokio::sync::mpsc;

    use super::{ConnectTarget, Connector, OutboundFrame, TransportEvent, TransportLink};
    use crate::error::ClientError;

    #[derive(Debug, Default)]
    struct Control {
        refusing: AtomicBool,
        attempts: AtomicU32,
    }

    /// Client side of the in-process transport.
    #[derive(Debug)]
    pub struct MemoryConnector {
        control: Arc<Control>,
        accepted: mpsc::UnboundedSender<MemoryPeer>,
    }

    /// Remote side of the in-process transport.
    #[derive(Debug)]
    pub struct MemoryGateway {
        control: Arc<Control>,
        accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    /// One accepted connection, seen from the gateway.
    #[derive(Debug)]
    pub struct MemoryPeer {
        target: ConnectTarget,
        from_client: mpsc::Receiver<OutboundFrame>,
        to_client: mpsc::Sender<TransportEvent>,
    }

    impl MemoryConnector {
        /// Create a connector and the gateway that accepts its connections.
        #[must_use]
        pub fn pair() -> (Self, MemoryGateway) {
            let control = Arc::new(Control::default());
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    control: Arc::clone(&control),
                    accepted: tx,
                },
                MemoryGateway {
                    control,
                    accepted: rx,
                },
            )
        }
    }

    impl Connector for MemoryConnector {
        fn connect(
            &self,
            target: ConnectTarget,
        ) -> BoxFuture<'_, Result<TransportLink, ClientError>> {
            Box::pin(async move {
                self.control.attempts.fetch_add(1, Ordering::SeqCst);
                if self.control.refusing.load(Ordering::SeqCst) {
                    return Err(ClientError::Transport("connection refused".to_string()));
                }

                let buffer = target.buffer.max(1);
                let (out_tx, out_rx) = mpsc::channel(buffer);
                let (in_tx, in_rx) = mpsc::channel(buffer);
                let peer = MemoryPeer {
                    target,
                    from_client: out_rx,
                    to_client: in_tx,
                };
                self.accepted
                    .send(peer)
                    .map_err(|_| ClientError::Transport("gateway is gone".to_string()))?;

                Ok(TransportLink {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            })
        }
    }

    impl MemoryGateway {
        /// Refuse (or stop refusing) new connections.
        pub fn set_refusing(&self, refusing: bool) {
            self.control.refusing.store(refusing, Ordering::SeqCst);
        }

        /// Number of open attempts seen, refused ones included.
        #[must_use]
        pub fn attempts(&self) -> u32 {
            self.control.attempts.load(Ordering::SeqCst)
        }

        /// Wait for the next accepted connection.
        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.accepted.recv().await
        }
    }

    impl MemoryPeer {
        /// Target the client asked for.
        #[must_use]
        pub const fn target(&self) -> &ConnectTarget {
            &self.target
        }

        /// Next frame written by the client, or `None` once it dropped the link.
        pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
            self.from_client.recv().await
        }

        /// Next text frame from the client decoded as an envelope, skipping close frames.
        pub async fn next_envelope(&mut self) -> Option<Envelope> {
            while let Some(frame) = self.from_client.recv().await {
                if let OutboundFrame::Text(text) = frame {
                    return Envelope::from_json(&text).ok();
                }
            }
            None
        }

        /// Deliver a raw text frame to the client.
        ///
        /// # Errors
        ///
        /// Returns an error if the client side is gone.
        pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
            self.deliver(TransportEvent::Text(text.into())).await
        }

        /// Deliver an envelope to the client.
        ///
        /// # Errors
        ///
        /// Returns an error if encoding fails or the client side is gone.
        pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
            self.send_text(envelope.to_json()?).await
        }

        /// Report a transport error to the client without closing.
        ///
        /// # Errors
        ///
        /// Returns an error if the client side is gone.
        pub async fn fail(&self, message: impl Into<String>) -> Result<(), ClientError> {
            self.deliver(TransportEvent::Error(message.into())).await
        }

        /// Close the connection from the gateway side.
        ///
        /// # Errors
        ///
        /// Returns an error if the client side is gone.
        pub async fn close(self, code: u16, reason: impl Into<String>) -> Result<(), ClientError> {
            self.deliver(TransportEvent::Closed {
                code,
                reason: reason.into(),
            })
            .await
        }

        async fn deliver(&self, event: TransportEvent) -> Result<(), ClientError> {
            self.to_client
                .send(event)
                .await
                .map_err(|_| ClientError::Transport("client is gone".to_string()))
        }
    }

}
