//! Error types for collabsync
//!
//! This module defines the error taxonomy used throughout the engine,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for collabsync operations
///
/// The first five variants mirror the failure classes the engine reasons
/// about (connection, persistence, decode, sandbox capability, process).
/// The remaining variants wrap ambient failures from configuration and I/O.
#[derive(Error, Debug)]
pub enum CollabError {
    /// Channel-level failure (network unreachable, transport dropped)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The channel server refused the credential
    #[error("Connection error: authentication rejected (HTTP {status})")]
    AuthRejected {
        /// HTTP status of the refused handshake
        status: u16,
    },

    /// A request to the project store failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A structured agent payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// No sandbox runtime is available in this deployment
    #[error("Sandbox unavailable: {reason}")]
    SandboxUnavailable {
        /// Human-readable explanation shown to the user
        reason: String,
    },

    /// A sandbox command exited unsuccessfully
    #[error("Process `{command}` failed with exit code {code}")]
    Process {
        /// The command line that was spawned
        command: String,
        /// Exit code reported by the runtime
        code: i32,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CollabError {
    /// Whether the error ends the affected operation for good.
    ///
    /// Terminal errors must be surfaced to the user as an explanatory
    /// status and never retried silently.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollabError::Connection(_)
                | CollabError::AuthRejected { .. }
                | CollabError::SandboxUnavailable { .. }
        )
    }
}

/// Result type alias for collabsync operations
///
/// Uses `anyhow::Error` so call sites can attach context; typed
/// [`CollabError`] values are recovered with `downcast_ref`.
pub type Result<T> = anyhow::Result<T>;

/// Find the [`CollabError`] carried by an `anyhow::Error`, if any.
pub fn collab_error(err: &anyhow::Error) -> Option<&CollabError> {
    err.downcast_ref::<CollabError>()
}
