//! Client event types.

use std::time::Duration;

use tether_proto::Envelope;

use crate::error::ClientError;

/// Events emitted by the connection controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The transport opened.
    Connected,
    /// The transport closed, for whatever reason.
    Disconnected {
        /// Close code.
        code: u16,
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnect attempt has been scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// An inbound envelope that was not a correlated reply.
    Message(Envelope),
    /// Transport failure or terminal give-up.
    Error(ClientError),
}

/// Discriminant of [`ClientEvent`], used as a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`ClientEvent::Connected`].
    Connected,
    /// See [`ClientEvent::Disconnected`].
    Disconnected,
    /// See [`ClientEvent::Reconnecting`].
    Reconnecting,
    /// See [`ClientEvent::Message`]. Subscribers receive every routed message.
    Message,
    /// See [`ClientEvent::Error`].
    Error,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Connected,
        Self::Disconnected,
        Self::Reconnecting,
        Self::Message,
        Self::Error,
    ];
}

impl ClientEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
        }
    }
}
