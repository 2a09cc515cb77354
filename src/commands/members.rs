//! Membership command handlers
//!
//! Every mutation is followed by a re-fetch, so the printed list always
//! reflects what the store holds.

use crate::cli::MembersCommand;
use crate::config::Config;
use crate::error::Result;
use crate::sync::CollaboratorRegistry;

use super::{build_store, print_members};

/// Dispatch a `members` subcommand
///
/// # Errors
///
/// Returns [`crate::error::CollabError::Persistence`] if the store rejects
/// the request.
pub async fn run_members(config: Config, command: MembersCommand) -> Result<()> {
    let store = build_store(&config)?;

    let session = match command {
        MembersCommand::List { project } => {
            CollaboratorRegistry::new(project, store).refresh().await?
        }
        MembersCommand::Add { project, user_ids } => {
            tracing::info!("adding {} user(s) to {}", user_ids.len(), project);
            CollaboratorRegistry::new(project, store)
                .add(&user_ids)
                .await?
        }
        MembersCommand::Remove { project, user_id } => {
            tracing::info!("removing {} from {}", user_id, project);
            CollaboratorRegistry::new(project, store)
                .remove(&user_id)
                .await?
        }
    };

    print_members(&session);
    Ok(())
}
