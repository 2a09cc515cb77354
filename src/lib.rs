//! collabsync - collaboration-synchronization engine
//!
//! This library keeps one client's view of a shared session consistent with
//! a project store and with peers connected over an event channel, and runs
//! the session's file tree in a disposable sandbox.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `channel`: Event channel transports, negotiation, connections and the
//!   session-keyed connection registry
//! - `sync`: Message, file tree and collaborator synchronization
//! - `sandbox`: Sandbox runtimes and the install/run orchestrator
//! - `session`: The session engine tying the above together
//! - `store`: Project store abstraction and its HTTP client
//! - `model`: Wire and domain types
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface and its handlers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collabsync::channel::{ConnectionRegistry, Negotiator, ReconnectPolicy};
//! use collabsync::model::User;
//! use collabsync::sandbox::{runtime_from_config, SandboxOrchestrator};
//! use collabsync::store::http::HttpStore;
//! use collabsync::{Config, SessionEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let store = Arc::new(HttpStore::new(
//!         &config.server.api_url,
//!         config.server.token.clone(),
//!         config.request_timeout(),
//!     )?);
//!     let registry = Arc::new(ConnectionRegistry::new(
//!         Arc::new(Negotiator::from_config(&config)),
//!         ReconnectPolicy::from_config(&config.channel),
//!     ));
//!     let (sandbox, _logs) =
//!         SandboxOrchestrator::from_config(runtime_from_config(&config.sandbox)?, &config.sandbox);
//!
//!     let mut engine = SessionEngine::enter(
//!         "project-1",
//!         User::new("u1", "me@example.com"),
//!         store,
//!         registry,
//!         sandbox,
//!     )
//!     .await?;
//!     engine.send_message("hello").await?;
//!     engine.leave().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod model;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::Config;
pub use error::{CollabError, Result};
pub use model::{ChatEntry, FileTree, Message, MessageBody, Session, User};
pub use sandbox::{RunStatus, SandboxOrchestrator};
pub use session::{SessionEngine, SessionEvent};
