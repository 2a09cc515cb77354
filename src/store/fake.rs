//! In-memory project store for unit tests
//!
//! [`MemoryStore`] keeps sessions and the user directory in memory and
//! records every file-tree write. Like the real store, membership writes
//! keep bare ids and only [`ProjectStore::get_project`] resolves them into
//! full user records.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::error::{CollabError, Result};
use crate::model::{FileTree, MemberRef, Message, Session, User};
use crate::store::ProjectStore;

#[derive(Debug, Default)]
struct State {
    projects: HashMap<String, Session>,
    users: Vec<User>,
    next_message_id: u64,
    failing: Vec<&'static str>,
    delays: HashMap<&'static str, Duration>,
    tree_writes: Vec<FileTree>,
    calls: Vec<String>,
}

/// In-memory [`ProjectStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session.
    pub fn with_project(self, project: Session) -> Self {
        self.lock().projects.insert(project.id.clone(), project);
        self
    }

    /// Seed the user directory.
    pub fn with_users(self, users: Vec<User>) -> Self {
        self.lock().users = users;
        self
    }

    /// Make every subsequent call to `operation` fail until [`Self::recover`].
    pub fn fail(&self, operation: &'static str) {
        self.lock().failing.push(operation);
    }

    /// Make every subsequent call to `operation` take at least `delay`.
    pub fn delay(&self, operation: &'static str, delay: Duration) {
        self.lock().delays.insert(operation, delay);
    }

    pub fn recover(&self) {
        self.lock().failing.clear();
    }

    /// Every whole-tree write, in submission order.
    pub fn tree_writes(&self) -> Vec<FileTree> {
        self.lock().tree_writes.clone()
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// The raw stored session (members unresolved).
    pub fn stored_project(&self, project_id: &str) -> Option<Session> {
        self.lock().projects.get(project_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn pause(&self, operation: &'static str) {
        let delay = self.lock().delays.get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn enter(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if state.failing.contains(&operation) {
            return Err(CollabError::Persistence(format!("{} failed (injected)", operation)).into());
        }
        Ok(state)
    }
}

fn missing(project_id: &str) -> anyhow::Error {
    CollabError::Persistence(format!("project {} not found", project_id)).into()
}

#[async_trait::async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, project_id: &str) -> Result<Session> {
        self.pause("get_project").await;
        let state = self.enter("get_project")?;
        let mut project = state
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| missing(project_id))?;
        project.members = project
            .members
            .into_iter()
            .map(|member| {
                state
                    .users
                    .iter()
                    .find(|u| u.id == member.id())
                    .map(|u| MemberRef::Resolved(u.clone()))
                    .unwrap_or(member)
            })
            .collect();
        Ok(project)
    }

    async fn get_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        self.pause("get_messages").await;
        let state = self.enter("get_messages")?;
        state
            .projects
            .get(project_id)
            .map(|p| p.messages.clone())
            .ok_or_else(|| missing(project_id))
    }

    async fn post_message(&self, project_id: &str, sender: &User, body: &str) -> Result<Message> {
        self.pause("post_message").await;
        let mut state = self.enter("post_message")?;
        state.next_message_id += 1;
        let message = Message {
            id: Some(format!("m{}", state.next_message_id)),
            sender: sender.clone(),
            body: body.to_string(),
            created_at: Some(Utc::now()),
        };
        state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| missing(project_id))?
            .messages
            .push(message.clone());
        Ok(message)
    }

    async fn update_file_tree(&self, project_id: &str, tree: &FileTree) -> Result<()> {
        self.pause("update_file_tree").await;
        let mut state = self.enter("update_file_tree")?;
        state.tree_writes.push(tree.clone());
        state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| missing(project_id))?
            .file_tree = tree.clone();
        Ok(())
    }

    async fn add_users(&self, project_id: &str, user_ids: &[String]) -> Result<()> {
        self.pause("add_users").await;
        let mut state = self.enter("add_users")?;
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| missing(project_id))?;
        for id in user_ids {
            if project.member(id).is_none() {
                project.members.push(MemberRef::Id(id.clone()));
            }
        }
        Ok(())
    }

    async fn remove_user(&self, project_id: &str, user_id: &str) -> Result<()> {
        self.pause("remove_user").await;
        let mut state = self.enter("remove_user")?;
        state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| missing(project_id))?
            .members
            .retain(|m| m.id() != user_id);
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<User>> {
        self.pause("all_users").await;
        let state = self.enter("all_users")?;
        Ok(state.users.clone())
    }
}

/// A session with the given id and no members, messages or files.
pub fn empty_project(id: &str) -> Session {
    Session {
        id: id.to_string(),
        name: format!("project {}", id),
        members: Vec::new(),
        file_tree: FileTree::new(),
        messages: Vec::new(),
    }
}
