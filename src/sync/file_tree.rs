//! Client-local replica of the shared file tree
//!
//! The whole tree is the unit of persistence: every flush sends the entire
//! mapping to the store with no version check. Two participants editing the
//! same path therefore overwrite each other and the last persisted write
//! wins. There is no conflict detection.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{FileEntry, FileTree, FileTreeDelta};
use crate::store::ProjectStore;

/// Local copy of one session's file tree.
///
/// Mutations are split into [`stage`](Self::stage) (local only) and
/// [`flush`](Self::flush) (persist the whole tree). [`edit`](Self::edit)
/// and [`merge_agent_delta`](Self::merge_agent_delta) do both.
#[derive(Debug)]
pub struct FileTreeReplica {
    project_id: String,
    store: Arc<dyn ProjectStore>,
    tree: FileTree,
    dirty: bool,
}

impl FileTreeReplica {
    pub fn new(project_id: impl Into<String>, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            project_id: project_id.into(),
            store,
            tree: FileTree::new(),
            dirty: false,
        }
    }

    /// Replace the local mapping wholesale with a store snapshot.
    ///
    /// Any unflushed local change is discarded.
    pub fn load(&mut self, snapshot: FileTree) {
        if self.dirty {
            tracing::warn!(
                "discarding unflushed file tree changes for project {}",
                self.project_id
            );
        }
        self.tree = snapshot;
        self.dirty = false;
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn contents(&self, path: &str) -> Option<&str> {
        self.tree.get(path).map(|entry| entry.contents.as_str())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.tree.keys().map(String::as_str)
    }

    /// Whether local changes have not yet been persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Set one path's contents locally without persisting.
    pub fn stage(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.tree.insert(path.into(), FileEntry::new(contents));
        self.dirty = true;
    }

    /// Persist the entire current tree.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::CollabError::Persistence`] when the store
    /// rejects the write. The local tree is kept and stays dirty.
    pub async fn flush(&mut self) -> Result<()> {
        match self.store.update_file_tree(&self.project_id, &self.tree).await {
            Ok(()) => {
                self.dirty = false;
                tracing::debug!(
                    "persisted file tree for project {} ({} files)",
                    self.project_id,
                    self.tree.len()
                );
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                tracing::warn!("file tree for project {} not persisted: {}", self.project_id, e);
                Err(e)
            }
        }
    }

    /// Change one path and persist the whole tree.
    pub async fn edit(&mut self, path: impl Into<String>, contents: impl Into<String>) -> Result<()> {
        self.stage(path, contents);
        self.flush().await
    }

    /// Shallow-merge an agent delta and persist, exactly like an edit.
    ///
    /// An empty delta changes nothing and is not persisted.
    pub async fn merge_agent_delta(&mut self, delta: FileTreeDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        tracing::info!(
            "merging {} agent file(s) into project {}",
            delta.len(),
            self.project_id
        );
        for (path, entry) in delta {
            self.tree.insert(path, entry);
        }
        self.dirty = true;
        self.flush().await
    }
}
