//! Session state synchronization
//!
//! Components that reconcile client-local state with the project store and
//! with peer broadcasts:
//!
//! - [`messages::MessageSynchronizer`] -- chat history: persist, append,
//!   broadcast; drop self-echoes and replays on receipt.
//! - [`file_tree::FileTreeReplica`] -- the local copy of the shared file
//!   tree, persisted whole on every flush.
//! - [`collaborators::CollaboratorRegistry`] -- membership changes followed
//!   by a full re-fetch of the session.
//!
//! None of these types lock internally. They are owned by one task (the
//! session engine) and mutated through `&mut self`.

pub mod collaborators;
pub mod file_tree;
pub mod messages;

pub use collaborators::CollaboratorRegistry;
pub use file_tree::FileTreeReplica;
pub use messages::{MessageSynchronizer, Received};
