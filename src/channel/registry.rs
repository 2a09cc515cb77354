//! Session-keyed connection registry
//!
//! [`ConnectionRegistry`] guarantees at most one open [`Connection`] per
//! session within the registry's lifetime. `open` hands back the existing
//! connection when there is one; `close` tears it down and forgets it so the
//! next `open` negotiates a fresh channel. Separate registries never share
//! connections, which keeps test harnesses independent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::{Connection, Connector, ReconnectPolicy};
use crate::error::Result;

/// Owner of the per-session channel handles.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Return the open connection for `session_id`, establishing one if
    /// needed.
    ///
    /// The registry lock is held across the connect so two concurrent
    /// opens for the same session cannot both connect.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Connection`] if a new channel
    /// cannot be established.
    pub async fn open(&self, session_id: &str) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(session_id) {
            if !existing.is_closed() {
                tracing::debug!("reusing channel {} for session {}", existing.id(), session_id);
                return Ok(Arc::clone(existing));
            }
            tracing::debug!("discarding closed channel for session {}", session_id);
            connections.remove(session_id);
        }

        let connection =
            Connection::establish(session_id, Arc::clone(&self.connector), self.policy).await?;
        connections.insert(session_id.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// The open connection for `session_id`, if any.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .await
            .get(session_id)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Close and forget the connection for `session_id`.
    ///
    /// Returns `true` if a connection was registered.
    pub async fn close(&self, session_id: &str) -> bool {
        match self.connections.lock().await.remove(session_id) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Close every registered connection.
    pub async fn close_all(&self) {
        for (_, connection) in self.connections.lock().await.drain() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::fake::FakeConnector;
    use crate::channel::ConnectionState;

    #[tokio::test]
    async fn test_open_twice_returns_same_connection() {
        let (connector, _handles) = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone(), ReconnectPolicy::none());

        let a = registry.open("p1").await.unwrap();
        let b = registry.open("p1").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_connections() {
        let (connector, _handles) = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone(), ReconnectPolicy::none());

        let a = registry.open("p1").await.unwrap();
        let b = registry.open("p2").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_close_then_open_creates_fresh_connection() {
        let (connector, _handles) = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone(), ReconnectPolicy::none());

        let first = registry.open("p1").await.unwrap();
        assert!(registry.close("p1").await);
        assert!(!registry.close("p1").await);
        assert!(registry.get("p1").await.is_none());

        let second = registry.open("p1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        assert!(first.is_closed());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_open_replaces_connection_that_closed_itself() {
        let (connector, mut handles) = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone(), ReconnectPolicy::none());

        let first = registry.open("p1").await.unwrap();
        drop(crate::channel::fake::next_handle(&mut handles).await);
        let mut state = first.watch_state();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Closed),
        )
        .await
        .unwrap()
        .unwrap();

        let second = registry.open("p1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_failed_open_registers_nothing() {
        let (connector, _handles) = FakeConnector::new();
        connector.fail_next(1);
        let registry = ConnectionRegistry::new(connector.clone(), ReconnectPolicy::none());

        assert!(registry.open("p1").await.is_err());
        assert!(registry.get("p1").await.is_none());
        assert!(registry.open("p1").await.is_ok());
    }
}
