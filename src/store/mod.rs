//! Project store abstraction
//!
//! The store is the external request/response service that owns sessions,
//! chat history, file trees and the user directory. The engine only ever
//! holds cached copies and re-reads from the store after mutations.
//!
//! - [`http::HttpStore`] -- REST client over `reqwest`.
//! - [`fake::MemoryStore`] -- in-memory store used in tests (cfg(test)
//!   only).

use crate::error::Result;
use crate::model::{FileTree, Message, Session, User};

/// Operations the engine consumes from the project store.
///
/// Every method is a single request; implementations report failures as
/// [`crate::error::CollabError::Persistence`].
#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync + std::fmt::Debug {
    /// Fetch the full session record with members resolved.
    async fn get_project(&self, project_id: &str) -> Result<Session>;

    /// Fetch the session's chat history in insertion order.
    async fn get_messages(&self, project_id: &str) -> Result<Vec<Message>>;

    /// Persist a chat message; the store assigns its id and timestamp.
    async fn post_message(&self, project_id: &str, sender: &User, body: &str) -> Result<Message>;

    /// Replace the session's whole file tree.
    async fn update_file_tree(&self, project_id: &str, tree: &FileTree) -> Result<()>;

    /// Add users to the session membership.
    async fn add_users(&self, project_id: &str, user_ids: &[String]) -> Result<()>;

    /// Remove one user from the session membership.
    async fn remove_user(&self, project_id: &str, user_id: &str) -> Result<()>;

    /// List the user directory.
    async fn all_users(&self) -> Result<Vec<User>>;
}

pub mod http;

#[cfg(test)]
pub mod fake;
