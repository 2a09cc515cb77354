//! Session membership
//!
//! Membership writes go to the store and are always followed by a full
//! re-fetch of the session: only the store can resolve member ids into
//! user records with an email to display.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{Session, User, UserSelection};
use crate::store::ProjectStore;

/// Adds and removes session members.
#[derive(Debug, Clone)]
pub struct CollaboratorRegistry {
    project_id: String,
    store: Arc<dyn ProjectStore>,
}

impl CollaboratorRegistry {
    pub fn new(project_id: impl Into<String>, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            project_id: project_id.into(),
            store,
        }
    }

    /// Add `user_ids` to the session and return the re-fetched record.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Persistence`] if either the
    /// write or the re-fetch fails.
    pub async fn add(&self, user_ids: &[String]) -> Result<Session> {
        if !user_ids.is_empty() {
            self.store.add_users(&self.project_id, user_ids).await?;
            tracing::info!(
                "added {} collaborator(s) to project {}",
                user_ids.len(),
                self.project_id
            );
        }
        self.refresh().await
    }

    /// Add every user in `selection`.
    pub async fn add_selection(&self, selection: &UserSelection) -> Result<Session> {
        self.add(&selection.ids()).await
    }

    /// Remove `user_id` from the session and return the re-fetched record.
    pub async fn remove(&self, user_id: &str) -> Result<Session> {
        self.store.remove_user(&self.project_id, user_id).await?;
        tracing::info!("removed {} from project {}", user_id, self.project_id);
        self.refresh().await
    }

    /// Fetch the session record with members resolved.
    pub async fn refresh(&self) -> Result<Session> {
        self.store.get_project(&self.project_id).await
    }

    /// The user directory, for picking collaborators.
    pub async fn directory(&self) -> Result<Vec<User>> {
        self.store.all_users().await
    }
}
