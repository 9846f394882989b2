//! Tether gateway client.
//!
//! Maintains one logical connection to a real-time gateway over WebSocket:
//! reconnects with exponential backoff, keeps the link alive with heartbeats,
//! correlates request/reply pairs and fans inbound messages out to typed
//! subscribers.
//!
//! ```no_run
//! use tether_client::{ClientConfig, ConnectionController, ReplyMatcher};
//! use tether_proto::Envelope;
//!
//! # async fn run() -> Result<(), tether_client::ClientError> {
//! let client = ConnectionController::new(ClientConfig::new("wss://gateway.example.com/ws"))?;
//! client.subscribe(tether_client::Topic::message_type("price_update"), |event| {
//!     println!("{event:?}");
//! });
//! client.connect().await?;
//!
//! let reply = client
//!     .request(
//!         Envelope::new("get_launchpad", serde_json::json!({ "id": "abc" })),
//!         ReplyMatcher::kind("launchpad"),
//!         None,
//!     )
//!     .await?;
//! println!("{}", reply.payload);
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod router;
pub mod state;
pub mod transport;
pub mod websocket;

pub use backoff::BackoffPolicy;
pub use config::ClientConfig;
pub use controller::ConnectionController;
pub use correlator::{ReplyMatcher, RequestCorrelator};
pub use error::ClientError;
pub use events::{ClientEvent, EventKind};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use router::{EventRouter, EventStream, SubscriptionId, Topic};
pub use state::ConnectionState;
pub use transport::{Connector, TransportLink};
pub use websocket::WebSocketConnector;
