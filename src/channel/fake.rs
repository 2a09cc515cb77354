//! In-process fake transport and connector for channel tests
//!
//! [`FakeConnector`] hands out a fresh [`FakeTransport`] per connect and
//! publishes the matching [`FakeTransportHandle`] so the test can play the
//! channel server:
//!
//! ```text
//! connection emit() --> outbound_tx --> handle.outbound_rx (test reads)
//! handle.inbound_tx --> inbound_rx  --> connection handlers
//! ```
//!
//! Dropping a handle's `inbound_tx` ends the transport's receive stream,
//! which the connection treats as a disconnect.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::channel::{Connector, Envelope, Transport};
use crate::config::TransportKind;
use crate::error::{CollabError, Result};

/// Send behaviour shared by a transport and its handle.
#[derive(Debug, Default)]
struct SendControl {
    delay_ms: AtomicU64,
    failing: AtomicBool,
}

/// In-memory [`Transport`].
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    closed: Arc<AtomicBool>,
    control: Arc<SendControl>,
}

impl FakeTransport {
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let closed = Arc::new(AtomicBool::new(false));
        let control = Arc::new(SendControl::default());

        let transport = Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            closed: Arc::clone(&closed),
            control: Arc::clone(&control),
        };
        let handle = FakeTransportHandle {
            outbound_rx,
            inbound_tx,
            closed,
            control,
        };
        (transport, handle)
    }
}

/// Test side of a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Frames the connection sent.
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the connection.
    pub inbound_tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    control: Arc<SendControl>,
}

impl FakeTransportHandle {
    /// Deliver a named event to the connection.
    pub fn push(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::to_string(&Envelope::new(event, data))
            .expect("FakeTransportHandle: envelope serializes");
        self.inbound_tx
            .send(frame)
            .expect("FakeTransportHandle: connection dropped its transport");
    }

    /// Next frame the connection emitted, decoded.
    pub async fn next_sent(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.outbound_rx.recv())
            .await
            .expect("timed out waiting for an emitted frame")
            .expect("outbound channel closed");
        serde_json::from_str(&frame).expect("emitted frame is an envelope")
    }

    /// Make every send take `delay` before it completes.
    pub fn delay_sends(&self, delay: Duration) {
        self.control
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every send fail.
    pub fn fail_sends(&self) {
        self.control.failing.store(true, Ordering::SeqCst);
    }

    /// Whether [`Transport::close`] was called on the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn send(&self, frame: String) -> Result<()> {
        let delay = self.control.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.control.failing.load(Ordering::SeqCst) {
            return Err(CollabError::Connection("FakeTransport send failed (injected)".into()).into());
        }
        self.outbound_tx.send(frame).map_err(|e| {
            anyhow::anyhow!(CollabError::Connection(format!(
                "FakeTransport outbound channel closed: {}",
                e
            )))
        })
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.inbound_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// [`Connector`] that yields [`FakeTransport`]s and can be told to fail.
#[derive(Debug)]
pub struct FakeConnector {
    handles_tx: mpsc::UnboundedSender<FakeTransportHandle>,
    failures_left: AtomicUsize,
    connects: AtomicUsize,
}

impl FakeConnector {
    /// Returns the connector and a receiver yielding one handle per
    /// successful connect.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeTransportHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            handles_tx,
            failures_left: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (connector, handles_rx)
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Total connect attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollabError::Connection(format!(
                "connection to session {} refused",
                session_id
            ))
            .into());
        }

        let (transport, handle) = FakeTransport::new();
        let _ = self.handles_tx.send(handle);
        Ok(Arc::new(transport))
    }
}

/// Wait for the connector to publish the next transport handle.
pub async fn next_handle(
    handles: &mut mpsc::UnboundedReceiver<FakeTransportHandle>,
) -> FakeTransportHandle {
    tokio::time::timeout(Duration::from_secs(2), handles.recv())
        .await
        .expect("timed out waiting for a connect")
        .expect("connector dropped")
}
