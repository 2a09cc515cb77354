//! Request/poll channel transport
//!
//! Fallback for deployments where the WebSocket upgrade is unavailable.
//! Frames are exchanged over plain HTTP:
//!
//! - `GET  {socket_url}/channel/poll?projectId=<session>&cursor=<n>` returns
//!   `{ "cursor": n, "events": [envelope, ...] }`.
//! - `POST {socket_url}/channel/emit?projectId=<session>` with one envelope
//!   as the JSON body.
//!
//! The first poll doubles as the handshake: its failure fails `connect`.
//! A later poll failure ends the receive stream, which the owning
//! connection treats as a disconnect.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::channel::{Envelope, Transport};
use crate::config::TransportKind;
use crate::error::{CollabError, Result};

const POLL_PATH: &str = "channel/poll";
const EMIT_PATH: &str = "channel/emit";
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default)]
    events: Vec<Envelope>,
}

/// HTTP polling transport.
#[derive(Debug)]
pub struct PollingTransport {
    client: reqwest::Client,
    emit_url: url::Url,
    token: Option<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

/// Map the socket base URL onto its HTTP equivalent and append `path`.
fn endpoint(socket_url: &str, path: &str, session_id: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(socket_url)
        .map_err(|e| CollabError::Config(format!("invalid socket url {}: {}", socket_url, e)))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
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
    url.set_path(&format!("{}/{}", base, path));
    url.query_pairs_mut().clear().append_pair("projectId", session_id);
    Ok(url)
}

async fn poll_once(
    client: &reqwest::Client,
    poll_url: &url::Url,
    token: Option<&str>,
    cursor: Option<u64>,
) -> Result<PollResponse> {
    let mut url = poll_url.clone();
    if let Some(cursor) = cursor {
        url.query_pairs_mut().append_pair("cursor", &cursor.to_string());
    }
    let mut req = client.get(url);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }

    let response = req
        .send()
        .await
        .map_err(|e| CollabError::Connection(format!("poll request failed: {}", e)))?;
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(CollabError::AuthRejected {
            status: status.as_u16(),
        }
        .into());
    }
    if !status.is_success() {
        return Err(CollabError::Connection(format!("poll returned HTTP {}", status)).into());
    }
    response
        .json::<PollResponse>()
        .await
        .map_err(|e| CollabError::Connection(format!("poll returned an invalid body: {}", e)).into())
}

fn forward(events: Vec<Envelope>, inbound_tx: &mpsc::UnboundedSender<String>) -> bool {
    for envelope in events {
        match serde_json::to_string(&envelope) {
            Ok(frame) => {
                if inbound_tx.send(frame).is_err() {
                    return false;
                }
            }
            Err(e) => tracing::warn!("dropping unserializable polled event: {}", e),
        }
    }
    true
}

impl PollingTransport {
    /// Handshake with the polling endpoint and start the poll loop.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::AuthRejected`] if the server refuses the
    /// credential and [`CollabError::Connection`] if the first poll fails
    /// otherwise.
    pub async fn connect(
        socket_url: &str,
        token: Option<&str>,
        session_id: &str,
        interval: Duration,
    ) -> Result<Self> {
        let poll_url = endpoint(socket_url, POLL_PATH, session_id)?;
        let emit_url = endpoint(socket_url, EMIT_PATH, session_id)?;
        let client = reqwest::Client::builder()
            .timeout(POLL_REQUEST_TIMEOUT)
            .build()
            .map_err(CollabError::Http)?;
        let token = token.map(str::to_string);

        tracing::debug!("polling handshake with {}", poll_url);
        let first = poll_once(&client, &poll_url, token.as_deref(), None).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let shutdown = CancellationToken::new();

        let loop_client = client.clone();
        let loop_token = token.clone();
        let loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut cursor = first.cursor;
            if !forward(first.events, &inbound_tx) {
                return;
            }
            loop {
                tokio::select! {
                    _ = loop_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match poll_once(&loop_client, &poll_url, loop_token.as_deref(), cursor).await {
                    Ok(batch) => {
                        cursor = batch.cursor.or(cursor);
                        if !forward(batch.events, &inbound_tx) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("poll loop ending: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            emit_url,
            token,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            shutdown,
        })
    }
}

#[async_trait::async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn send(&self, frame: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CollabError::Connection("polling transport is closed".to_string()).into());
        }
        let mut req = self
            .client
            .post(self.emit_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| CollabError::Connection(format!("emit request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(CollabError::Connection(format!(
                "emit returned HTTP {}",
                response.status()
            ))
            .into());
        }
        Ok(())
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

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
