//! Session event channel
//!
//! One bidirectional event channel per active session carries chat
//! broadcasts between participants. The module is layered:
//!
//! - [`Transport`] -- moves serialized frames; implementations in
//!   [`websocket`] (persistent duplex) and [`polling`] (request/poll
//!   fallback), plus [`fake`] for tests (cfg(test) only).
//! - [`Connector`] -- establishes a transport for a session;
//!   [`negotiate::Negotiator`] tries the configured transports in order.
//! - [`connection::Connection`] -- named-event handlers, fire-and-forget
//!   `emit`, status events and the reconnection policy.
//! - [`registry::ConnectionRegistry`] -- at most one open connection per
//!   session, with explicit `open`/`close`.
//!
//! # Framing
//!
//! Every frame is a JSON [`Envelope`] `{"event": .., "data": ..}`.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::TransportKind;
use crate::error::Result;

/// Inbound connection status: transport established.
pub const EVENT_CONNECT: &str = "connect";
/// Inbound connection status: transport dropped.
pub const EVENT_DISCONNECT: &str = "disconnect";
/// Inbound connection status: (re)connection attempt failed.
pub const EVENT_CONNECT_ERROR: &str = "connect_error";
/// Chat broadcast between participants.
pub const EVENT_PROJECT_MESSAGE: &str = "project-message";
/// Sandbox server announced a preview address (`{port, url}`).
pub const EVENT_SERVER_READY: &str = "server-ready";

/// Wire envelope for one named event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Moves serialized [`Envelope`] frames to and from the channel server.
///
/// Reconnection is not the transport's job: when the peer goes away the
/// `receive` stream ends and the owning connection decides what to do.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Send one complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Connection`] if the frame
    /// cannot be handed to the peer.
    async fn send(&self, frame: String) -> Result<()>;

    /// Stream of inbound frames; ends when the transport is closed or the
    /// peer disconnects.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Tear the transport down. Idempotent.
    async fn close(&self);
}

/// Establishes an authenticated transport for a session.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Connect to `session_id`'s channel.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Connection`] on auth rejection
    /// or when no transport can reach the server.
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn Transport>>;
}

pub mod connection;
pub mod negotiate;
pub mod polling;
pub mod registry;
pub mod websocket;

#[cfg(test)]
pub mod fake;

pub use connection::{Connection, ConnectionState, ReconnectPolicy};
pub use negotiate::Negotiator;
pub use registry::ConnectionRegistry;
