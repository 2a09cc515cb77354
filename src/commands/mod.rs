/*!
Command handlers for the CLI

This module provides the handlers invoked by the CLI entrypoint:

- `chat`    - Interactive session: chat, shared files, sandbox runs
- `run`     - Run a project's file tree in the sandbox and stream its logs
- `members` - List, add and remove collaborators
- `users`   - List the user directory

Handlers build their store, channel and sandbox from [`Config`] and use the
library components; they own all terminal output.
*/

use std::sync::Arc;

use colored::Colorize;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::model::{MemberRef, Session, User};
use crate::sandbox::RunStatus;
use crate::store::http::HttpStore;
use crate::store::ProjectStore;

pub mod chat;
pub mod members;
pub mod run;
pub mod special_commands;
pub mod users;

/// Build the HTTP store client from configuration.
pub(crate) fn build_store(config: &Config) -> Result<Arc<dyn ProjectStore>> {
    let store = HttpStore::new(
        &config.server.api_url,
        config.server.token.clone(),
        config.request_timeout(),
    )?;
    Ok(Arc::new(store))
}

/// Wait for a run started on its own task to settle.
///
/// Pends forever when no run is starting, so it can sit in a `select!`
/// branch guarded by `run.is_some()`.
pub(crate) async fn settle_run(run: &mut Option<JoinHandle<Result<RunStatus>>>) -> Result<RunStatus> {
    match run {
        Some(handle) => handle.await?,
        None => std::future::pending().await,
    }
}

/// Print a session's collaborators, one per line.
pub(crate) fn print_members(session: &Session) {
    let title = if session.name.is_empty() {
        session.id.as_str()
    } else {
        session.name.as_str()
    };
    println!("{} ({} collaborators)", title.bold(), session.members.len());
    for member in &session.members {
        match member {
            MemberRef::Resolved(user) if !user.email.is_empty() => {
                println!("  {}  {}", user.email, user.id.dimmed())
            }
            other => println!("  {}  {}", other.id(), "(unresolved)".dimmed()),
        }
    }
}

/// Print users, one per line.
pub(crate) fn print_users(users: &[User]) {
    if users.is_empty() {
        println!("No users found");
        return;
    }
    for user in users {
        println!("  {}  {}", user.email, user.id.dimmed());
    }
}
