//! A live session channel
//!
//! [`Connection`] owns one transport at a time and a background driver
//! task that:
//!
//! - forwards frames queued by [`Connection::emit`] to the transport,
//!   concurrently with reading, so a slow send never holds up dispatch,
//! - decodes inbound [`Envelope`]s and dispatches them to the handler
//!   registered for the event name,
//! - on transport loss dispatches `disconnect`, then re-negotiates
//!   according to its [`ReconnectPolicy`], dispatching `connect` or
//!   `connect_error` per attempt.
//!
//! A frame whose send fails stays queued and is sent first on the next
//! transport.
//!
//! Handlers are stored in a map keyed by event name, so registering a
//! handler for an already-registered event replaces the previous one and
//! reconnects never duplicate a subscription.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{
    Connector, Envelope, Transport, EVENT_CONNECT, EVENT_CONNECT_ERROR, EVENT_DISCONNECT,
};
use crate::config::{ChannelConfig, TransportKind};
use crate::error::{CollabError, Result};

/// A handler for one named event, called with the event's `data`.
pub type EventHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

type HandlerMap = HashMap<String, EventHandler>;

/// How a dropped channel is re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up; zero disables reconnection.
    pub attempts: u32,
    /// Delay step; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            attempts: config.reconnect_attempts,
            backoff: Duration::from_millis(config.reconnect_backoff_ms),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected(TransportKind),
    Reconnecting { attempt: u32 },
    Closed,
}

/// One open channel for one session.
///
/// Created by [`Connection::establish`], normally through
/// [`crate::channel::ConnectionRegistry::open`].
pub struct Connection {
    id: Uuid,
    session_id: String,
    handlers: Arc<Mutex<HandlerMap>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<ConnectionState>,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to `session_id` and start the driver task.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Connection`] if the initial connect fails;
    /// no driver is started in that case.
    pub async fn establish(
        session_id: &str,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let transport = connector.connect(session_id).await.map_err(|e| {
            tracing::error!("channel for session {} failed to connect: {}", session_id, e);
            e
        })?;
        let kind = transport.kind();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected(kind));
        let handlers: Arc<Mutex<HandlerMap>> = Arc::new(Mutex::new(HashMap::new()));
        let cancellation = CancellationToken::new();
        let id = Uuid::new_v4();

        let driver = Driver {
            session_id: session_id.to_string(),
            connector,
            policy,
            handlers: Arc::clone(&handlers),
            state_tx,
            cancellation: cancellation.clone(),
        };
        tokio::spawn(driver.run(transport, outbound_rx));

        tracing::info!(
            "channel {} connected for session {} via {}",
            id,
            session_id,
            kind.as_str()
        );

        Ok(Arc::new(Self {
            id,
            session_id: session_id.to_string(),
            handlers,
            outbound_tx,
            state_rx,
            cancellation,
        }))
    }

    /// Unique id of this connection instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancellation.is_cancelled() || self.state() == ConnectionState::Closed
    }

    /// Register `handler` for `event`, replacing any previous handler.
    ///
    /// Returns `true` when a previous handler was replaced.
    pub fn on(
        &self,
        event: impl Into<String>,
        handler: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) -> bool {
        let event = event.into();
        let replaced = lock(&self.handlers)
            .insert(event.clone(), Arc::new(handler))
            .is_some();
        if replaced {
            tracing::debug!("replaced handler for channel event {}", event);
        }
        replaced
    }

    /// Remove the handler for `event`. Returns `true` if one was registered.
    pub fn off(&self, event: &str) -> bool {
        lock(&self.handlers).remove(event).is_some()
    }

    pub fn has_handler(&self, event: &str) -> bool {
        lock(&self.handlers).contains_key(event)
    }

    /// Queue `payload` as `event` for delivery. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Connection`] if the connection is closed and
    /// [`CollabError::Serialization`] if `payload` cannot be serialized.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(CollabError::Connection(format!(
                "cannot emit {}: connection closed",
                event
            ))
            .into());
        }
        let frame = serde_json::to_string(&Envelope::new(event, serde_json::to_value(payload)?))?;
        self.outbound_tx.send(frame).map_err(|_| {
            CollabError::Connection(format!("cannot emit {}: channel driver stopped", event))
        })?;
        tracing::debug!("emitted {} on session {}", event, self.session_id);
        Ok(())
    }

    /// Tear down the transport and stop the driver. Idempotent.
    pub fn close(&self) {
        if !self.cancellation.is_cancelled() {
            tracing::info!("closing channel {} for session {}", self.id, self.session_id);
            self.cancellation.cancel();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

fn lock(handlers: &Mutex<HandlerMap>) -> std::sync::MutexGuard<'_, HandlerMap> {
    handlers.lock().unwrap_or_else(|e| e.into_inner())
}

fn dispatch(handlers: &Mutex<HandlerMap>, event: &str, data: serde_json::Value) {
    // Clone out of the map so a handler may call `on`/`off` itself.
    let handler = lock(handlers).get(event).cloned();
    match handler {
        Some(handler) => handler(data),
        None => tracing::trace!("no handler registered for channel event {}", event),
    }
}

fn dispatch_frame(handlers: &Mutex<HandlerMap>, raw: &str) {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) => dispatch(handlers, &envelope.event, envelope.data),
        Err(e) => tracing::warn!("dropping malformed channel frame: {}", e),
    }
}

enum PumpExit {
    Cancelled,
    Dropped(String),
}

struct Driver {
    session_id: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    handlers: Arc<Mutex<HandlerMap>>,
    state_tx: watch::Sender<ConnectionState>,
    cancellation: CancellationToken,
}

impl Driver {
    async fn run(
        self,
        mut transport: Arc<dyn Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut unsent = VecDeque::new();
        loop {
            let exit = self.pump(&transport, &mut outbound_rx, &mut unsent).await;
            transport.close().await;

            match exit {
                PumpExit::Cancelled => break,
                PumpExit::Dropped(reason) => {
                    tracing::warn!("channel for session {} dropped: {}", self.session_id, reason);
                    dispatch(
                        &self.handlers,
                        EVENT_DISCONNECT,
                        serde_json::json!({ "reason": reason }),
                    );
                    match self.reconnect().await {
                        Some(next) => transport = next,
                        None => break,
                    }
                }
            }
        }
        if !unsent.is_empty() {
            tracing::warn!(
                "channel for session {} closed with {} unsent frame(s)",
                self.session_id,
                unsent.len()
            );
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        tracing::debug!("channel driver for session {} stopped", self.session_id);
    }

    async fn pump(
        &self,
        transport: &Arc<dyn Transport>,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        unsent: &mut VecDeque<String>,
    ) -> PumpExit {
        // A frame leaves `unsent` only once the transport accepted it.
        let writer = async {
            loop {
                if unsent.is_empty() {
                    match outbound_rx.recv().await {
                        Some(frame) => unsent.push_back(frame),
                        None => return PumpExit::Cancelled,
                    }
                }
                let Some(frame) = unsent.front().cloned() else {
                    continue;
                };
                if let Err(e) = transport.send(frame).await {
                    return PumpExit::Dropped(format!("send failed: {}", e));
                }
                unsent.pop_front();
            }
        };

        let reader = async {
            let mut inbound = transport.receive();
            while let Some(raw) = inbound.next().await {
                dispatch_frame(&self.handlers, &raw);
            }
            PumpExit::Dropped("transport closed".to_string())
        };

        tokio::select! {
            biased;

            _ = self.cancellation.cancelled() => PumpExit::Cancelled,
            exit = writer => exit,
            exit = reader => exit,
        }
    }

    async fn reconnect(&self) -> Option<Arc<dyn Transport>> {
        for attempt in 1..=self.policy.attempts {
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt });

            let delay = self.policy.backoff * attempt;
            let connected = tokio::select! {
                _ = self.cancellation.cancelled() => return None,
                result = async {
                    tokio::time::sleep(delay).await;
                    self.connector.connect(&self.session_id).await
                } => result,
            };

            match connected {
                Ok(transport) => {
                    let kind = transport.kind();
                    self.state_tx.send_replace(ConnectionState::Connected(kind));
                    tracing::info!(
                        "channel for session {} reconnected via {} (attempt {})",
                        self.session_id,
                        kind.as_str(),
                        attempt
                    );
                    dispatch(
                        &self.handlers,
                        EVENT_CONNECT,
                        serde_json::json!({ "transport": kind.as_str(), "attempt": attempt }),
                    );
                    return Some(transport);
                }
                Err(e) => {
                    tracing::warn!(
                        "reconnect attempt {} for session {} failed: {}",
                        attempt,
                        self.session_id,
                        e
                    );
                    dispatch(
                        &self.handlers,
                        EVENT_CONNECT_ERROR,
                        serde_json::json!({ "message": e.to_string(), "attempt": attempt }),
                    );
                }
            }
        }
        None
    }
}
