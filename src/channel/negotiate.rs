//! Transport negotiation
//!
//! [`Negotiator`] is the production [`Connector`]: it tries the configured
//! transports in preference order (WebSocket first by default) and returns
//! the first that connects. An authentication rejection stops negotiation
//! immediately, since another transport would be rejected the same way.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::polling::PollingTransport;
use crate::channel::websocket::WebSocketTransport;
use crate::channel::{Connector, Transport};
use crate::config::{Config, TransportKind};
use crate::error::{CollabError, Result};

/// Connects with the first transport in `preference` that succeeds.
#[derive(Debug, Clone)]
pub struct Negotiator {
    socket_url: String,
    token: Option<String>,
    preference: Vec<TransportKind>,
    poll_interval: Duration,
}

impl Negotiator {
    pub fn new(
        socket_url: impl Into<String>,
        token: Option<String>,
        preference: Vec<TransportKind>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            socket_url: socket_url.into(),
            token,
            preference,
            poll_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server.socket_url.clone(),
            config.server.token.clone(),
            config.channel.transports.clone(),
            Duration::from_millis(config.channel.poll_interval_ms),
        )
    }

    async fn connect_with(
        &self,
        kind: TransportKind,
        session_id: &str,
    ) -> Result<Arc<dyn Transport>> {
        let token = self.token.as_deref();
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::Websocket => {
                Arc::new(WebSocketTransport::connect(&self.socket_url, token, session_id).await?)
            }
            TransportKind::Polling => Arc::new(
                PollingTransport::connect(&self.socket_url, token, session_id, self.poll_interval)
                    .await?,
            ),
        };
        Ok(transport)
    }
}

fn is_auth_rejection(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CollabError>(),
        Some(CollabError::AuthRejected { .. })
    )
}

#[async_trait::async_trait]
impl Connector for Negotiator {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn Transport>> {
        let mut failures = Vec::new();

        for kind in &self.preference {
            match self.connect_with(*kind, session_id).await {
                Ok(transport) => {
                    tracing::debug!(
                        "negotiated {} transport for session {}",
                        kind.as_str(),
                        session_id
                    );
                    return Ok(transport);
                }
                Err(e) if is_auth_rejection(&e) => return Err(e),
                Err(e) => {
                    tracing::debug!("{} transport unavailable: {}", kind.as_str(), e);
                    failures.push(format!("{}: {}", kind.as_str(), e));
                }
            }
        }

        Err(CollabError::Connection(format!(
            "no transport could reach the channel server ({})",
            failures.join("; ")
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejection_detection() {
        let err: anyhow::Error = CollabError::AuthRejected { status: 401 }.into();
        assert!(is_auth_rejection(&err));
        let err: anyhow::Error =
            CollabError::Connection("authentication rejected (HTTP 401)".into()).into();
        assert!(!is_auth_rejection(&err));
        let err: anyhow::Error = CollabError::Connection("poll returned HTTP 500".into()).into();
        assert!(!is_auth_rejection(&err));
    }

    #[tokio::test]
    async fn test_all_transports_failing_reports_each() {
        let negotiator = Negotiator::new(
            "ws://127.0.0.1:9",
            None,
            vec![TransportKind::Websocket, TransportKind::Polling],
            Duration::from_millis(50),
        );
        let err = negotiator.connect("p1").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("websocket:"), "{msg}");
        assert!(msg.contains("polling:"), "{msg}");
    }
}
