//! Data model shared by the store, the channel and the sync components
//!
//! Wire shapes follow the project store's JSON (`_id`, `createdAt`,
//! `fileTree`). Agent payloads are decoded exactly once, when a message
//! enters local history, into a [`MessageBody`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;

/// Sender id reserved for the automated participant.
pub const AGENT_SENDER_ID: &str = "ai";

/// A participant, keyed by id and displayed by email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub email: String,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }

    /// The automated participant's sender reference.
    pub fn agent() -> Self {
        Self::new(AGENT_SENDER_ID, "AI")
    }

    pub fn is_agent(&self) -> bool {
        self.id == AGENT_SENDER_ID
    }
}

/// A session member as returned by the store.
///
/// The store may return bare ids when membership was patched without
/// population; only [`MemberRef::Resolved`] carries a displayable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberRef {
    Resolved(User),
    Id(String),
}

impl MemberRef {
    pub fn id(&self) -> &str {
        match self {
            MemberRef::Resolved(user) => &user.id,
            MemberRef::Id(id) => id,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            MemberRef::Resolved(user) if !user.email.is_empty() => Some(&user.email),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.email().is_some()
    }
}

/// Contents of one file in the shared tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FileEntryRepr")]
pub struct FileEntry {
    pub contents: String,
}

impl FileEntry {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }
}

/// Accepts both `{contents}` and the mount-style `{file: {contents}}` shape.
#[derive(Deserialize)]
#[serde(untagged)]
enum FileEntryRepr {
    Flat { contents: String },
    Nested { file: NestedFile },
}

#[derive(Deserialize)]
struct NestedFile {
    contents: String,
}

impl From<FileEntryRepr> for FileEntry {
    fn from(repr: FileEntryRepr) -> Self {
        match repr {
            FileEntryRepr::Flat { contents } => FileEntry { contents },
            FileEntryRepr::Nested { file } => FileEntry {
                contents: file.contents,
            },
        }
    }
}

/// Path to contents mapping. Ordered so persisted snapshots are stable.
pub type FileTree = BTreeMap<String, FileEntry>;

/// Partial file tree delivered by the agent; merged path by path.
pub type FileTreeDelta = FileTree;

/// The shared workspace as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "users", alias = "members")]
    pub members: Vec<MemberRef>,
    #[serde(default, rename = "fileTree")]
    pub file_tree: FileTree,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn member(&self, user_id: &str) -> Option<&MemberRef> {
        self.members.iter().find(|m| m.id() == user_id)
    }
}

/// A chat message in its wire/persisted form.
///
/// `id` and `created_at` are absent until the store has persisted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: User,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_from_agent(&self) -> bool {
        self.sender.is_agent()
    }
}

/// Structured reply from the automated participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPayload {
    /// Markdown text shown in chat.
    pub text: String,
    /// Files the agent wants written into the shared tree.
    #[serde(
        default,
        rename = "fileTree",
        alias = "fileTreeDelta",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_tree_delta: Option<FileTreeDelta>,
}

/// A message body after boundary decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Plain(String),
    Agent(AgentPayload),
    /// Agent body that failed to decode; kept so history stays complete.
    Undecodable { raw: String, error: String },
}

impl MessageBody {
    /// Decode a message body according to its sender.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Decode`] when an agent message body is not a
    /// valid [`AgentPayload`].
    pub fn decode(message: &Message) -> std::result::Result<Self, CollabError> {
        if !message.is_from_agent() {
            return Ok(MessageBody::Plain(message.body.clone()));
        }
        serde_json::from_str::<AgentPayload>(&message.body)
            .map(MessageBody::Agent)
            .map_err(|e| CollabError::Decode(format!("invalid agent payload: {}", e)))
    }

    /// Text to display for this body.
    pub fn text(&self) -> &str {
        match self {
            MessageBody::Plain(text) => text,
            MessageBody::Agent(payload) => &payload.text,
            MessageBody::Undecodable { .. } => "",
        }
    }
}

/// One entry of local chat history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub message: Message,
    pub body: MessageBody,
    /// Authored by the local user.
    pub own: bool,
}

impl ChatEntry {
    pub fn sender_email(&self) -> &str {
        &self.message.sender.email
    }
}

/// Explicit set of selected user ids (collaborator picker).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSelection {
    ids: BTreeSet<String>,
}

impl UserSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Select `id` if unselected, otherwise deselect it. Returns the new state.
    pub fn toggle(&mut self, id: &str) -> bool {
        if self.ids.remove(id) {
            false
        } else {
            self.ids.insert(id.to_string());
            true
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for UserSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::json!({
            "_id": "m1",
            "sender": {"_id": "u1", "email": "a@example.com"},
            "message": "hello",
            "createdAt": "2024-05-01T10:00:00Z"
        });
        let msg: Message = serde_json::from_value(json).unwrap();
        assert_eq!(msg.id.as_deref(), Some("m1"));
        assert_eq!(msg.sender.email, "a@example.com");
        assert_eq!(msg.body, "hello");
        assert!(msg.created_at.is_some());
    }

    #[test]
    fn test_unpersisted_message_omits_id() {
        let msg = Message {
            id: None,
            sender: User::new("u1", "a@example.com"),
            body: "draft".into(),
            created_at: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("_id").is_none());
        assert!(value.get("createdAt").is_none());
        assert_eq!(value["message"], "draft");
    }

    #[test]
    fn test_decode_plain_body_for_human_sender() {
        let msg = Message {
            id: Some("m1".into()),
            sender: User::new("u1", "a@example.com"),
            body: r#"{"text":"not parsed"}"#.into(),
            created_at: None,
        };
        assert_eq!(
            MessageBody::decode(&msg).unwrap(),
            MessageBody::Plain(r#"{"text":"not parsed"}"#.into())
        );
    }

    #[test]
    fn test_decode_agent_payload_with_nested_file_entries() {
        let body = serde_json::json!({
            "text": "Created **app.js**",
            "fileTree": {
                "app.js": {"file": {"contents": "console.log(1)"}},
                "package.json": {"contents": "{}"}
            }
        })
        .to_string();
        let msg = Message {
            id: Some("m2".into()),
            sender: User::agent(),
            body,
            created_at: None,
        };
        let MessageBody::Agent(payload) = MessageBody::decode(&msg).unwrap() else {
            panic!("expected agent payload");
        };
        assert_eq!(payload.text, "Created **app.js**");
        let delta = payload.file_tree_delta.unwrap();
        assert_eq!(delta["app.js"].contents, "console.log(1)");
        assert_eq!(delta["package.json"].contents, "{}");
    }

    #[test]
    fn test_decode_agent_payload_failure_is_decode_error() {
        let msg = Message {
            id: Some("m3".into()),
            sender: User::agent(),
            body: "plain words from a confused agent".into(),
            created_at: None,
        };
        assert!(matches!(
            MessageBody::decode(&msg),
            Err(CollabError::Decode(_))
        ));
    }

    #[test]
    fn test_session_members_resolved_and_bare() {
        let json = serde_json::json!({
            "_id": "p1",
            "name": "demo",
            "users": [{"_id": "u1", "email": "a@example.com"}, "u2"],
            "fileTree": {"index.js": {"contents": "x"}}
        });
        let session: Session = serde_json::from_value(json).unwrap();
        assert!(session.member("u1").unwrap().is_resolved());
        assert!(!session.member("u2").unwrap().is_resolved());
        assert_eq!(session.file_tree["index.js"].contents, "x");
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_user_selection_toggle() {
        let mut selection = UserSelection::new();
        assert!(selection.toggle("u1"));
        assert!(selection.contains("u1"));
        assert!(!selection.toggle("u1"));
        assert!(selection.is_empty());

        let selection: UserSelection = ["b", "a", "b"].into_iter().collect();
        assert_eq!(selection.ids(), vec!["a".to_string(), "b".to_string()]);
    }
}
