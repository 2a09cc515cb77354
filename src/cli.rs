//! Command-line interface definition for collabsync
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for joining a session, running the project in the
//! sandbox, and managing collaborators.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// collabsync - collaborative session client
///
/// Chat with collaborators and the agent, share the project's file tree,
/// and run it in a disposable sandbox with a live preview.
#[derive(Parser, Debug, Clone)]
#[command(name = "collabsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/collabsync.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Bearer credential (overrides config and COLLABSYNC_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Store base URL override
    #[arg(long)]
    pub api_url: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for collabsync
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Join a session interactively: chat, edit files, run the project
    Chat {
        /// Project (session) identifier
        #[arg(short, long)]
        project: String,

        /// Local user id
        #[arg(long)]
        user_id: String,

        /// Local user email (display key)
        #[arg(long)]
        email: String,
    },

    /// Run the project's file tree in the sandbox and stream its logs
    Run {
        /// Project (session) identifier
        #[arg(short, long)]
        project: String,

        /// Mount the tree into this directory instead of a temp dir
        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// Manage session collaborators
    Members {
        /// Membership subcommand
        #[command(subcommand)]
        command: MembersCommand,
    },

    /// List every user known to the store
    Users,
}

/// Membership subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum MembersCommand {
    /// Show the session's collaborators
    List {
        /// Project (session) identifier
        #[arg(short, long)]
        project: String,
    },

    /// Add one or more users to the session
    Add {
        /// Project (session) identifier
        #[arg(short, long)]
        project: String,

        /// User ids to add
        #[arg(required = true)]
        user_ids: Vec<String>,
    },

    /// Remove a user from the session
    Remove {
        /// Project (session) identifier
        #[arg(short, long)]
        project: String,

        /// User id to remove
        user_id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
