//! WebSocket channel transport
//!
//! The preferred transport: one persistent duplex socket at
//! `{socket_url}/channel/ws?projectId=<session>`, authenticated with an
//! `Authorization: Bearer <token>` header on the upgrade request. Each
//! [`crate::channel::Envelope`] travels as one text frame.
//!
//! Two background tasks own the socket halves. The writer drains an
//! internal channel into the sink and sends a close frame on shutdown; the
//! reader forwards text frames to the receive stream and ends it when the
//! peer closes or errors.

use std::pin::Pin;
use std::sync::Arc;

use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use crate::channel::Transport;
use crate::config::TransportKind;
use crate::error::{CollabError, Result};

/// Path of the WebSocket endpoint below the socket base URL.
pub const WEBSOCKET_PATH: &str = "channel/ws";

/// Persistent duplex transport over `tokio-tungstenite`.
#[derive(Debug)]
pub struct WebSocketTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

/// Build the upgrade URL for `session_id`.
///
/// `http`/`https` bases are mapped to `ws`/`wss`.
pub fn websocket_url(socket_url: &str, session_id: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(socket_url)
        .map_err(|e| CollabError::Config(format!("invalid socket url {}: {}", socket_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(CollabError::Config(format!(
                "unsupported socket url scheme: {}",
                other
            ))
            .into())
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CollabError::Config(format!("cannot use scheme {} for {}", scheme, socket_url)))?;

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/{}", base, WEBSOCKET_PATH));
    url.query_pairs_mut().clear().append_pair("projectId", session_id);
    Ok(url)
}

impl WebSocketTransport {
    /// Open the socket for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::AuthRejected`] on a 401/403 upgrade response
    /// and [`CollabError::Connection`] when the upgrade is otherwise refused
    /// or the server is unreachable.
    pub async fn connect(socket_url: &str, token: Option<&str>, session_id: &str) -> Result<Self> {
        let url = websocket_url(socket_url, session_id)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| CollabError::Connection(format!("invalid websocket request: {}", e)))?;
        if let Some(token) = token {
            let value = format!("Bearer {}", token)
                .parse::<tungstenite::http::HeaderValue>()
                .map_err(|_| CollabError::Config("token is not a valid header value".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        tracing::debug!("websocket connecting to {}", url);
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(describe_connect_error)?;
        let (mut sink, mut stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let shutdown = CancellationToken::new();

        // Writer: outbound channel -> socket sink.
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = sink.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(tungstenite::Message::Text(frame)).await {
                                tracing::debug!("websocket write failed: {}", e);
                                writer_shutdown.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: socket stream -> inbound channel.
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        tracing::debug!("websocket closed by peer: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("websocket read failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            reader_shutdown.cancel();
        });

        Ok(Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            shutdown,
        })
    }
}

fn describe_connect_error(err: tungstenite::Error) -> anyhow::Error {
    let message = match &err {
        tungstenite::Error::Http(response)
            if response.status() == 401 || response.status() == 403 =>
        {
            return CollabError::AuthRejected {
                status: response.status().as_u16(),
            }
            .into();
        }
        tungstenite::Error::Http(response) => {
            format!("websocket upgrade refused (HTTP {})", response.status())
        }
        other => format!("websocket connect failed: {}", other),
    };
    CollabError::Connection(message).into()
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    async fn send(&self, frame: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CollabError::Connection("websocket is closed".to_string()).into());
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| CollabError::Connection("websocket writer stopped".to_string()).into())
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
        self.shutdown.cancel();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
