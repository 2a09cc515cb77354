//! REST client for the project store
//!
//! Endpoints consumed:
//!
//! - `GET  /projects/get-project/:id` -> `{ project }`
//! - `GET  /projects/messages/:id` -> `{ messages }`
//! - `POST /projects/message` `{ projectId, sender, message }` -> `{ message }`
//! - `PUT  /projects/update-file-tree` `{ projectId, fileTree }`
//! - `PUT  /projects/add-user` `{ projectId, users }`
//! - `PUT  /projects/remove-user` `{ projectId, userId }`
//! - `GET  /users/all` -> `{ users }`
//!
//! The bearer credential, when configured, is attached to every request.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{CollabError, Result};
use crate::model::{FileTree, Message, Session, User};
use crate::store::ProjectStore;

#[derive(Deserialize)]
struct ProjectEnvelope {
    project: Session,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct MessageEnvelope {
    message: Message,
}

#[derive(Deserialize)]
struct UsersEnvelope {
    #[serde(default)]
    users: Vec<User>,
}

/// [`ProjectStore`] backed by the store's HTTP API.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use collabsync::store::http::HttpStore;
///
/// let store = HttpStore::new("http://localhost:3000", Some("token".into()), Duration::from_secs(30))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: url::Url,
    token: Option<String>,
}

impl HttpStore {
    /// Build a store client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Config`] if `base_url` does not parse, or
    /// [`CollabError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base = url::Url::parse(base_url)
            .map_err(|e| CollabError::Config(format!("invalid store url {}: {}", base_url, e)))?;
        // Url::join drops the last segment unless the base ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CollabError::Http)?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn url(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| CollabError::Config(format!("invalid store path {}: {}", path, e)).into())
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| CollabError::Persistence(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("store request {} returned HTTP {}", what, status);
            return Err(CollabError::Persistence(format!(
                "{} returned HTTP {}: {}",
                what,
                status,
                body.trim()
            ))
            .into());
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
        response.json::<T>().await.map_err(|e| {
            CollabError::Persistence(format!("{} returned an unexpected body: {}", what, e)).into()
        })
    }
}

#[async_trait::async_trait]
impl ProjectStore for HttpStore {
    async fn get_project(&self, project_id: &str) -> Result<Session> {
        let what = "GET /projects/get-project";
        let url = self.url(&format!("projects/get-project/{}", project_id))?;
        tracing::debug!("store: {} {}", what, project_id);
        let response = self.execute(self.client.get(url), what).await?;
        let envelope: ProjectEnvelope = Self::decode(response, what).await?;
        Ok(envelope.project)
    }

    async fn get_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let what = "GET /projects/messages";
        let url = self.url(&format!("projects/messages/{}", project_id))?;
        let response = self.execute(self.client.get(url), what).await?;
        let envelope: MessagesEnvelope = Self::decode(response, what).await?;
        Ok(envelope.messages)
    }

    async fn post_message(&self, project_id: &str, sender: &User, body: &str) -> Result<Message> {
        let what = "POST /projects/message";
        let url = self.url("projects/message")?;
        let payload = serde_json::json!({
            "projectId": project_id,
            "sender": sender,
            "message": body,
        });
        let response = self.execute(self.client.post(url).json(&payload), what).await?;
        let envelope: MessageEnvelope = Self::decode(response, what).await?;
        Ok(envelope.message)
    }

    async fn update_file_tree(&self, project_id: &str, tree: &FileTree) -> Result<()> {
        let what = "PUT /projects/update-file-tree";
        let url = self.url("projects/update-file-tree")?;
        let payload = serde_json::json!({
            "projectId": project_id,
            "fileTree": tree,
        });
        tracing::debug!("store: {} ({} files)", what, tree.len());
        self.execute(self.client.put(url).json(&payload), what).await?;
        Ok(())
    }

    async fn add_users(&self, project_id: &str, user_ids: &[String]) -> Result<()> {
        let what = "PUT /projects/add-user";
        let url = self.url("projects/add-user")?;
        let payload = serde_json::json!({
            "projectId": project_id,
            "users": user_ids,
        });
        self.execute(self.client.put(url).json(&payload), what).await?;
        Ok(())
    }

    async fn remove_user(&self, project_id: &str, user_id: &str) -> Result<()> {
        let what = "PUT /projects/remove-user";
        let url = self.url("projects/remove-user")?;
        let payload = serde_json::json!({
            "projectId": project_id,
            "userId": user_id,
        });
        self.execute(self.client.put(url).json(&payload), what).await?;
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<User>> {
        let what = "GET /users/all";
        let url = self.url("users/all")?;
        let response = self.execute(self.client.get(url), what).await?;
        let envelope: UsersEnvelope = Self::decode(response, what).await?;
        Ok(envelope.users)
    }
}
