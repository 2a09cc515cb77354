//! Chat history synchronization
//!
//! Outgoing messages are persisted first and only then appended locally and
//! broadcast, so every record a peer sees already carries its store id.
//! Incoming broadcasts are reconciled against local history:
//!
//! 1. a broadcast from the local user is its own echo and is dropped,
//! 2. a broadcast whose id is already in history is a replay and is dropped,
//! 3. anything else is appended in receipt order.
//!
//! Agent bodies are decoded once, when they enter history. A body that
//! fails to decode is kept as [`MessageBody::Undecodable`] so the stream
//! keeps flowing.

use std::collections::HashSet;
use std::sync::Arc;

use crate::channel::{Connection, EVENT_PROJECT_MESSAGE};
use crate::error::{CollabError, Result};
use crate::model::{ChatEntry, FileTreeDelta, Message, MessageBody, User};
use crate::store::ProjectStore;

/// Outcome of reconciling one inbound broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// The local user's own message coming back over the channel.
    SelfEcho,
    /// Already in history (at-least-once delivery or reconnect replay).
    Duplicate,
    /// Appended to history.
    Appended {
        entry: ChatEntry,
        /// Files the agent delivered with the message, to be merged into
        /// the file tree replica.
        delta: Option<FileTreeDelta>,
    },
}

/// Chat history for one session, seen from one local user.
#[derive(Debug)]
pub struct MessageSynchronizer {
    project_id: String,
    local_user: User,
    store: Arc<dyn ProjectStore>,
    connection: Arc<Connection>,
    history: Vec<ChatEntry>,
    seen_ids: HashSet<String>,
}

impl MessageSynchronizer {
    /// Create a synchronizer with empty history
    ///
    /// # Arguments
    ///
    /// * `project_id` - Session the history belongs to
    /// * `local_user` - The user this client acts as; their broadcasts are
    ///   treated as self-echo
    /// * `store` - Persistence for outgoing messages
    /// * `connection` - The session's open channel, used for broadcasts
    pub fn new(
        project_id: impl Into<String>,
        local_user: User,
        store: Arc<dyn ProjectStore>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            local_user,
            store,
            connection,
            history: Vec::new(),
            seen_ids: HashSet::new(),
        }
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    /// Local history in display order.
    pub fn history(&self) -> &[ChatEntry] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Replace local history with `messages` as fetched from the store.
    ///
    /// Agent file deltas in past messages are not re-applied; the store's
    /// file tree already reflects them.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        self.history.clear();
        self.seen_ids.clear();
        for message in messages {
            if let Some(id) = &message.id {
                if !self.seen_ids.insert(id.clone()) {
                    continue;
                }
            }
            let entry = self.entry_for(message);
            self.history.push(entry);
        }
        tracing::debug!(
            "loaded {} messages for project {}",
            self.history.len(),
            self.project_id
        );
    }

    /// Persist, append and broadcast a chat message
    ///
    /// Surrounding whitespace is trimmed before the text is persisted, and
    /// whitespace-only input is ignored and yields `Ok(None)`.
    ///
    /// # Arguments
    ///
    /// * `body` - Raw message text as typed
    ///
    /// # Returns
    ///
    /// The appended history entry, carrying the store-assigned id
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Persistence`] when the store rejects the
    /// message. Nothing is appended or broadcast in that case, so the
    /// caller can keep the input and retry.
    pub async fn send(&mut self, body: &str) -> Result<Option<ChatEntry>> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(None);
        }

        let persisted = self
            .store
            .post_message(&self.project_id, &self.local_user, body)
            .await
            .map_err(|e| {
                tracing::warn!("message for project {} not persisted: {}", self.project_id, e);
                e
            })?;

        if let Some(id) = &persisted.id {
            self.seen_ids.insert(id.clone());
        }
        let entry = self.entry_for(persisted.clone());
        self.history.push(entry.clone());

        // Already persisted: peers pick it up on their next load.
        if let Err(e) = self.connection.emit(EVENT_PROJECT_MESSAGE, &persisted) {
            tracing::warn!("broadcast of message {:?} failed: {}", persisted.id, e);
        }

        Ok(Some(entry))
    }

    /// Reconcile one `project-message` broadcast.
    pub fn on_receive(&mut self, message: Message) -> Received {
        if message.sender.id == self.local_user.id {
            tracing::trace!("dropping self-echo {:?}", message.id);
            return Received::SelfEcho;
        }
        if let Some(id) = &message.id {
            if !self.seen_ids.insert(id.clone()) {
                tracing::debug!("dropping replayed message {}", id);
                return Received::Duplicate;
            }
        }

        let entry = self.entry_for(message);
        let delta = match &entry.body {
            MessageBody::Agent(payload) => payload.file_tree_delta.clone(),
            _ => None,
        };
        self.history.push(entry.clone());
        Received::Appended { entry, delta }
    }

    /// Decode raw broadcast data and reconcile it.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Decode`] when `data` is not a message record.
    /// History is unchanged in that case.
    pub fn on_broadcast(&mut self, data: serde_json::Value) -> Result<Received> {
        let message: Message = serde_json::from_value(data)
            .map_err(|e| CollabError::Decode(format!("malformed project-message: {}", e)))?;
        Ok(self.on_receive(message))
    }

    fn entry_for(&self, message: Message) -> ChatEntry {
        let body = MessageBody::decode(&message).unwrap_or_else(|e| {
            tracing::warn!("message {:?}: {}", message.id, e);
            MessageBody::Undecodable {
                raw: message.body.clone(),
                error: e.to_string(),
            }
        });
        let own = message.sender.id == self.local_user.id;
        ChatEntry { message, body, own }
    }
}
