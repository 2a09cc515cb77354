//! Session engine
//!
//! [`SessionEngine`] is the single owner of one client's view of a session.
//! Entering a session opens (or reuses) the session's connection from the
//! [`ConnectionRegistry`], subscribes the channel handlers and loads the
//! project, its message history and its file tree from the store.
//!
//! Channel handlers do no work themselves: they forward each event into an
//! internal queue. The engine drains that queue with
//! [`SessionEngine::next_inbound`] and reconciles one event at a time with
//! [`SessionEngine::apply`], interleaved with the user actions it exposes
//! (`send_message`, `edit_file`, `run`, ...). All sync state is therefore
//! mutated from one task and needs no locks.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{
    Connection, ConnectionRegistry, ConnectionState, EVENT_CONNECT, EVENT_CONNECT_ERROR,
    EVENT_DISCONNECT, EVENT_PROJECT_MESSAGE, EVENT_SERVER_READY,
};
use crate::error::Result;
use crate::model::{ChatEntry, FileTree, Session, User, UserSelection};
use crate::sandbox::{PreviewAddress, RunStatus, SandboxOrchestrator};
use crate::store::ProjectStore;
use crate::sync::{CollaboratorRegistry, FileTreeReplica, MessageSynchronizer, Received};

/// A channel event queued by a handler, waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connect(serde_json::Value),
    Disconnect(serde_json::Value),
    ConnectError(serde_json::Value),
    ProjectMessage(serde_json::Value),
    ServerReady(serde_json::Value),
}

/// Something the user-visible layer should show.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The channel was (re)established.
    Connected { transport: String },
    /// The channel dropped; a reconnect may follow.
    Disconnected { reason: String },
    /// A (re)connection attempt failed.
    ConnectFailed { message: String },
    /// A peer or agent message was appended to history.
    Message(ChatEntry),
    /// An agent delta was merged into the file tree and persisted.
    FilesMerged { paths: Vec<String> },
    /// The sandbox server can be previewed.
    Preview(PreviewAddress),
    /// A contained failure (undecodable event, failed persistence).
    Warning(String),
}

#[derive(Debug, Default, Deserialize)]
struct StatusData {
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StatusData {
    fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }
}

/// One client's live session.
#[derive(Debug)]
pub struct SessionEngine {
    project_id: String,
    store: Arc<dyn ProjectStore>,
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    session: Session,
    messages: MessageSynchronizer,
    files: FileTreeReplica,
    collaborators: CollaboratorRegistry,
    sandbox: SandboxOrchestrator,
    inbound_tx: mpsc::UnboundedSender<ChannelEvent>,
    inbound_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Forward every channel event the engine reconciles into `inbound_tx`.
fn subscribe_handlers(connection: &Connection, inbound_tx: &mpsc::UnboundedSender<ChannelEvent>) {
    let forward = |make: fn(serde_json::Value) -> ChannelEvent| {
        let tx = inbound_tx.clone();
        move |data: serde_json::Value| {
            let _ = tx.send(make(data));
        }
    };
    connection.on(EVENT_CONNECT, forward(ChannelEvent::Connect));
    connection.on(EVENT_DISCONNECT, forward(ChannelEvent::Disconnect));
    connection.on(EVENT_CONNECT_ERROR, forward(ChannelEvent::ConnectError));
    connection.on(EVENT_PROJECT_MESSAGE, forward(ChannelEvent::ProjectMessage));
    connection.on(EVENT_SERVER_READY, forward(ChannelEvent::ServerReady));
}

impl SessionEngine {
    /// Enter a session
    ///
    /// Opens the session's channel, subscribes the handlers, then loads the
    /// project, the message history and the file tree, in that order.
    ///
    /// # Arguments
    ///
    /// * `project_id` - Session to enter
    /// * `local_user` - The user this client acts as
    /// * `store` - Project store
    /// * `registry` - Connection registry; at most one connection per session
    /// * `sandbox` - Run orchestrator for this session
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Connection`] if the channel
    /// cannot be opened and [`crate::error::CollabError::Persistence`] if
    /// the initial load fails.
    pub async fn enter(
        project_id: &str,
        local_user: User,
        store: Arc<dyn ProjectStore>,
        registry: Arc<ConnectionRegistry>,
        sandbox: SandboxOrchestrator,
    ) -> Result<Self> {
        let connection = registry.open(project_id).await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Broadcasts arriving during the load queue up here; the history
        // load below marks their ids seen, so replays apply as duplicates.
        subscribe_handlers(&connection, &inbound_tx);

        let session = store.get_project(project_id).await?;
        let history = store.get_messages(project_id).await?;

        let mut messages = MessageSynchronizer::new(
            project_id,
            local_user,
            Arc::clone(&store),
            Arc::clone(&connection),
        );
        messages.load_history(history);

        let mut files = FileTreeReplica::new(project_id, Arc::clone(&store));
        files.load(session.file_tree.clone());

        let engine = Self {
            project_id: project_id.to_string(),
            collaborators: CollaboratorRegistry::new(project_id, Arc::clone(&store)),
            store,
            registry,
            connection,
            session,
            messages,
            files,
            sandbox,
            inbound_tx,
            inbound_rx,
        };

        tracing::info!(
            "entered project {} as {} ({} messages, {} files)",
            engine.project_id,
            engine.messages.local_user().email,
            engine.messages.len(),
            engine.files.tree().len()
        );
        Ok(engine)
    }

    /// Register the channel handlers.
    ///
    /// Safe to call any number of times: each registration replaces the
    /// previous handler for the same event.
    pub fn subscribe(&self) {
        subscribe_handlers(&self.connection, &self.inbound_tx);
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn local_user(&self) -> &User {
        self.messages.local_user()
    }

    /// Cached session record, refreshed after membership changes.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn history(&self) -> &[ChatEntry] {
        self.messages.history()
    }

    pub fn files(&self) -> &FileTreeReplica {
        &self.files
    }

    pub fn sandbox(&self) -> &SandboxOrchestrator {
        &self.sandbox
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Send a chat message. See [`MessageSynchronizer::send`].
    pub async fn send_message(&mut self, body: &str) -> Result<Option<ChatEntry>> {
        self.messages.send(body).await
    }

    /// Change one file and persist the whole tree.
    pub async fn edit_file(&mut self, path: &str, contents: &str) -> Result<()> {
        self.files.edit(path, contents).await
    }

    /// Change one file locally; persisted by the next [`Self::save_files`].
    pub fn stage_file(&mut self, path: &str, contents: &str) {
        self.files.stage(path, contents);
    }

    pub async fn save_files(&mut self) -> Result<()> {
        self.files.flush().await
    }

    pub async fn add_collaborators(&mut self, user_ids: &[String]) -> Result<&Session> {
        self.session = self.collaborators.add(user_ids).await?;
        Ok(&self.session)
    }

    pub async fn add_selection(&mut self, selection: &UserSelection) -> Result<&Session> {
        self.session = self.collaborators.add_selection(selection).await?;
        Ok(&self.session)
    }

    pub async fn remove_collaborator(&mut self, user_id: &str) -> Result<&Session> {
        self.session = self.collaborators.remove(user_id).await?;
        Ok(&self.session)
    }

    /// The user directory.
    pub async fn directory(&self) -> Result<Vec<User>> {
        self.collaborators.directory().await
    }

    /// Re-fetch the project, history and file tree from the store.
    pub async fn reload(&mut self) -> Result<()> {
        self.session = self.store.get_project(&self.project_id).await?;
        let history = self.store.get_messages(&self.project_id).await?;
        self.messages.load_history(history);
        self.files.load(self.session.file_tree.clone());
        Ok(())
    }

    /// Run the current file tree in the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::SandboxUnavailable`] when the
    /// deployment has no sandbox.
    pub async fn run(&self) -> Result<RunStatus> {
        let tree: FileTree = self.files.tree().clone();
        self.sandbox.run(&tree).await
    }

    /// Run the current file tree on a background task.
    ///
    /// Mounting and installing can take minutes; the engine stays free to
    /// apply channel events, and [`Self::stop`] interrupts the run.
    pub fn start_run(&self) -> JoinHandle<Result<RunStatus>> {
        let tree: FileTree = self.files.tree().clone();
        let sandbox = self.sandbox.clone();
        tokio::spawn(async move { sandbox.run(&tree).await })
    }

    pub async fn stop(&self) -> RunStatus {
        self.sandbox.stop().await
    }

    /// Wait for the next queued channel event. Cancel safe.
    pub async fn next_inbound(&mut self) -> Option<ChannelEvent> {
        self.inbound_rx.recv().await
    }

    /// Wait for channel events until one produces something to show.
    pub async fn next_events(&mut self) -> Vec<SessionEvent> {
        loop {
            let Some(inbound) = self.next_inbound().await else {
                return Vec::new();
            };
            let events = self.apply(inbound).await;
            if !events.is_empty() {
                return events;
            }
        }
    }

    /// Reconcile one channel event with local state.
    pub async fn apply(&mut self, inbound: ChannelEvent) -> Vec<SessionEvent> {
        match inbound {
            ChannelEvent::ProjectMessage(data) => self.apply_message(data).await,
            ChannelEvent::Connect(data) => {
                let transport = StatusData::from_value(data)
                    .transport
                    .unwrap_or_else(|| "unknown".to_string());
                let mut events = vec![SessionEvent::Connected { transport }];
                events.extend(self.catch_up().await);
                events
            }
            ChannelEvent::Disconnect(data) => vec![SessionEvent::Disconnected {
                reason: StatusData::from_value(data)
                    .reason
                    .unwrap_or_else(|| "connection lost".to_string()),
            }],
            ChannelEvent::ConnectError(data) => vec![SessionEvent::ConnectFailed {
                message: StatusData::from_value(data)
                    .message
                    .unwrap_or_else(|| "connection failed".to_string()),
            }],
            ChannelEvent::ServerReady(data) => {
                match serde_json::from_value::<PreviewAddress>(data) {
                    Ok(address) => {
                        self.sandbox.observe_preview(address.clone());
                        if self.sandbox.preview().as_ref() == Some(&address) {
                            vec![SessionEvent::Preview(address)]
                        } else {
                            Vec::new()
                        }
                    }
                    Err(e) => vec![SessionEvent::Warning(format!(
                        "malformed server-ready event: {}",
                        e
                    ))],
                }
            }
        }
    }

    async fn apply_message(&mut self, data: serde_json::Value) -> Vec<SessionEvent> {
        match self.messages.on_broadcast(data) {
            Ok(Received::Appended { entry, delta }) => {
                let mut events = vec![SessionEvent::Message(entry)];
                if let Some(delta) = delta {
                    events.push(self.merge_delta(delta).await);
                }
                events
            }
            Ok(Received::SelfEcho) | Ok(Received::Duplicate) => Vec::new(),
            Err(e) => {
                tracing::warn!("ignoring project-message: {}", e);
                vec![SessionEvent::Warning(e.to_string())]
            }
        }
    }

    async fn merge_delta(&mut self, delta: crate::model::FileTreeDelta) -> SessionEvent {
        let paths: Vec<String> = delta.keys().cloned().collect();
        match self.files.merge_agent_delta(delta).await {
            Ok(()) => SessionEvent::FilesMerged { paths },
            Err(e) => SessionEvent::Warning(format!("agent files not saved: {}", e)),
        }
    }

    /// Append messages persisted while the channel was down.
    async fn catch_up(&mut self) -> Vec<SessionEvent> {
        let fetched = match self.store.get_messages(&self.project_id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                return vec![SessionEvent::Warning(format!(
                    "could not fetch missed messages: {}",
                    e
                ))]
            }
        };

        let mut events = Vec::new();
        for message in fetched {
            if let Received::Appended { entry, delta } = self.messages.on_receive(message) {
                events.push(SessionEvent::Message(entry));
                if let Some(delta) = delta {
                    events.push(self.merge_delta(delta).await);
                }
            }
        }
        if !events.is_empty() {
            tracing::info!("caught up on {} missed event(s)", events.len());
        }
        events
    }

    /// Stop any run and close the session's connection.
    pub async fn leave(self) {
        if self.sandbox.status().is_active() {
            self.sandbox.stop().await;
        }
        self.registry.close(&self.project_id).await;
        tracing::info!("left project {}", self.project_id);
    }
}
