//! User directory listing

use crate::config::Config;
use crate::error::Result;

use super::{build_store, print_users};

/// Print every user known to the store.
pub async fn run_users(config: Config) -> Result<()> {
    let store = build_store(&config)?;
    let users = store.all_users().await?;
    tracing::debug!("store returned {} users", users.len());
    print_users(&users);
    Ok(())
}
