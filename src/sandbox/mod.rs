//! Sandbox execution of a session's file tree
//!
//! [`SandboxRuntime`] is the capability boundary: mount a file tree, spawn
//! commands in it, and announce when a spawned server starts listening.
//! Implementations:
//!
//! - [`local::LocalSandbox`] -- runs commands as local child processes in a
//!   scratch directory (development deployments).
//! - [`unavailable::UnavailableSandbox`] -- rejects everything with
//!   [`CollabError::SandboxUnavailable`] and a specific reason.
//! - [`fake::FakeSandbox`] -- scripted runtime for tests (cfg(test) only).
//!
//! [`orchestrator::SandboxOrchestrator`] drives the mount, install and run
//! lifecycle on top of a runtime.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

use crate::config::SandboxConfig;
use crate::error::{CollabError, Result};
use crate::model::FileTree;

pub mod local;
pub mod orchestrator;
pub mod unavailable;

#[cfg(test)]
pub mod fake;

pub use local::LocalSandbox;
pub use orchestrator::SandboxOrchestrator;
pub use unavailable::UnavailableSandbox;

/// Exit code reported when a process ended without one (killed by signal).
pub const KILLED_EXIT_CODE: i32 = -1;

/// Raw output of a spawned process, stdout and stderr interleaved.
pub type OutputStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Address at which a started project can be previewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewAddress {
    pub port: u16,
    pub url: String,
}

/// Lifecycle of the session's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Mounting,
    Installing,
    Running,
    Stopped,
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Mounting | RunStatus::Installing | RunStatus::Running
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Mounting => write!(f, "mounting"),
            RunStatus::Installing => write!(f, "installing"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Which command produced a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Install,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Install => "install",
            Stage::Run => "run",
        }
    }
}

/// One line of process output delivered to the log sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stage: Stage,
    pub line: String,
}

/// Handle to one spawned sandbox process.
///
/// The output stream can be taken once. The exit code resolves when the
/// process ends, whether on its own or after [`SandboxProcess::kill`].
pub struct SandboxProcess {
    command: String,
    output: Option<OutputStream>,
    exit_rx: oneshot::Receiver<i32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl fmt::Debug for SandboxProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxProcess")
            .field("command", &self.command)
            .field("output_taken", &self.output.is_none())
            .finish_non_exhaustive()
    }
}

impl SandboxProcess {
    /// Assemble a handle from a runtime's process plumbing.
    ///
    /// The runtime must send the exit code on `exit_rx`'s sender when the
    /// process ends and terminate the process when `kill_tx` fires.
    pub fn new(
        command: impl Into<String>,
        output: OutputStream,
        exit_rx: oneshot::Receiver<i32>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            command: command.into(),
            output: Some(output),
            exit_rx,
            kill_tx: Some(kill_tx),
        }
    }

    /// Command line, for logs and errors.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Wait for the process to end and return its exit code.
    ///
    /// Cancel safe.
    pub async fn wait(&mut self) -> i32 {
        (&mut self.exit_rx).await.unwrap_or(KILLED_EXIT_CODE)
    }

    /// Ask the runtime to terminate the process. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    /// Kill the process and wait until it has ended.
    pub async fn terminate(&mut self) -> i32 {
        self.kill();
        self.wait().await
    }
}

/// Execution environment capability.
#[async_trait::async_trait]
pub trait SandboxRuntime: Send + Sync + fmt::Debug {
    /// Why this runtime cannot execute anything, or `None` if it can.
    fn unavailable_reason(&self) -> Option<String>;

    /// Load `tree` into the sandbox filesystem, replacing what a previous
    /// mount put there.
    async fn mount(&self, tree: &FileTree) -> Result<()>;

    /// Start `command` (program followed by arguments) in the mounted tree.
    async fn spawn(&self, command: &[String]) -> Result<SandboxProcess>;

    /// Subscribe to server-ready announcements from processes spawned
    /// after this call.
    fn subscribe_ready(&self) -> broadcast::Receiver<PreviewAddress>;
}

/// Build the runtime the configuration allows.
///
/// # Errors
///
/// Returns [`CollabError::Config`] if the local runtime cannot be prepared
/// (bad ready pattern, unusable workdir).
pub fn runtime_from_config(config: &SandboxConfig) -> Result<Arc<dyn SandboxRuntime>> {
    if let Some(reason) = config.unavailable_reason() {
        tracing::info!("sandbox unavailable: {}", reason);
        return Ok(Arc::new(UnavailableSandbox::new(reason)));
    }
    Ok(Arc::new(LocalSandbox::from_config(config)?))
}

/// Fail with [`CollabError::SandboxUnavailable`] if `runtime` cannot run.
pub fn ensure_available(runtime: &dyn SandboxRuntime) -> Result<()> {
    match runtime.unavailable_reason() {
        Some(reason) => Err(CollabError::SandboxUnavailable { reason }.into()),
        None => Ok(()),
    }
}
