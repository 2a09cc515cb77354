//! Run lifecycle for one session
//!
//! ```text
//! Idle -> Mounting -> Installing -> Running -> Stopped | Failed
//!                                      |
//!                                      +-> Mounting   (re-run)
//! ```
//!
//! At most one run process is alive per orchestrator. `run` terminates the
//! previous process and waits for it to end before it mounts the new tree,
//! so two runs never overlap. Install and run failures end in
//! [`RunStatus::Failed`] and are returned as status, not as errors; only a
//! missing sandbox capability makes `run` return `Err`.
//!
//! The orchestrator is a handle: clones share the same run, so a caller can
//! drive `run` on its own task and still `stop` it from another clone.
//! `stop` or a newer `run` interrupts a run that is still mounting or
//! installing.
//!
//! The running process is watched by a supervisor task. A generation
//! counter keeps a superseded supervisor from overwriting the status or
//! preview of a newer run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::error::{CollabError, Result};
use crate::model::FileTree;
use crate::sandbox::{
    ensure_available, LogLine, OutputStream, PreviewAddress, RunStatus, SandboxProcess,
    SandboxRuntime, Stage,
};

const MAX_LOG_LINE_BYTES: usize = 64 * 1024;
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

struct ActiveRun {
    kill_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ActiveRun {
    async fn terminate(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Err(e) = self.supervisor.await {
            tracing::warn!("run supervisor ended abnormally: {}", e);
        }
    }
}

/// Drives mount, install and run on a [`SandboxRuntime`].
#[derive(Clone)]
pub struct SandboxOrchestrator {
    runtime: Arc<dyn SandboxRuntime>,
    install_command: Arc<[String]>,
    start_command: Arc<[String]>,
    status_tx: Arc<watch::Sender<RunStatus>>,
    preview_tx: Arc<watch::Sender<Option<PreviewAddress>>>,
    log_tx: mpsc::UnboundedSender<LogLine>,
    generation: Arc<AtomicU64>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    setup: Arc<std::sync::Mutex<CancellationToken>>,
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("runtime", &self.runtime)
            .field("status", &*self.status_tx.borrow())
            .field(
                "active",
                &self.active.try_lock().map(|active| active.is_some()).ok(),
            )
            .finish_non_exhaustive()
    }
}

impl SandboxOrchestrator {
    /// Create an idle orchestrator
    ///
    /// # Arguments
    ///
    /// * `runtime` - Sandbox capability to run on
    /// * `install_command` - Dependency installation command line
    /// * `start_command` - Command line that starts the project
    ///
    /// # Returns
    ///
    /// The orchestrator and the receiving end of its log sink. Every line of
    /// install and run output is sent there as soon as it is read, tagged
    /// with its [`Stage`].
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        install_command: Vec<String>,
        start_command: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        let (preview_tx, _) = watch::channel(None);
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            runtime,
            install_command: install_command.into(),
            start_command: start_command.into(),
            status_tx: Arc::new(status_tx),
            preview_tx: Arc::new(preview_tx),
            log_tx,
            generation: Arc::new(AtomicU64::new(0)),
            active: Arc::new(Mutex::new(None)),
            setup: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
        };
        (orchestrator, log_rx)
    }

    pub fn from_config(
        runtime: Arc<dyn SandboxRuntime>,
        config: &SandboxConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        Self::new(
            runtime,
            config.install_command.clone(),
            config.start_command.clone(),
        )
    }

    pub fn status(&self) -> RunStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    /// Preview address of the current run, once the server is ready.
    pub fn preview(&self) -> Option<PreviewAddress> {
        self.preview_tx.borrow().clone()
    }

    pub fn watch_preview(&self) -> watch::Receiver<Option<PreviewAddress>> {
        self.preview_tx.subscribe()
    }

    /// Why the runtime cannot run, or `None` when it can.
    pub fn unavailable_reason(&self) -> Option<String> {
        self.runtime.unavailable_reason()
    }

    /// Mount `tree`, install dependencies and start the project.
    ///
    /// Returns the status the run settled in: [`RunStatus::Running`] once
    /// the start command is spawned, [`RunStatus::Failed`] if mounting,
    /// installing or spawning failed, and [`RunStatus::Stopped`] if
    /// [`Self::stop`] or a newer `run` interrupted it before the start
    /// command was spawned.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::SandboxUnavailable`] without touching the
    /// runtime when no sandbox is available.
    pub async fn run(&self, tree: &FileTree) -> Result<RunStatus> {
        ensure_available(self.runtime.as_ref()).map_err(|e| {
            tracing::error!("run rejected: {}", e);
            e
        })?;

        let cancel = CancellationToken::new();
        let superseded = std::mem::replace(&mut *self.setup(), cancel.clone());
        superseded.cancel();

        let mut active = self.active.lock().await;
        if cancel.is_cancelled() {
            return Ok(self.interrupted());
        }
        if let Some(previous) = active.take() {
            tracing::info!("terminating previous run before re-run");
            previous.terminate().await;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.preview_tx.send_replace(None);

        self.set_status(RunStatus::Mounting);
        let mounted = tokio::select! {
            _ = cancel.cancelled() => return Ok(self.interrupted()),
            mounted = self.runtime.mount(tree) => mounted,
        };
        if let Err(e) = mounted {
            return Ok(self.fail(format!("mount failed: {:#}", e)));
        }

        self.set_status(RunStatus::Installing);
        let mut install = match self.runtime.spawn(&self.install_command).await {
            Ok(process) => process,
            Err(e) => return Ok(self.fail(format!("{:#}", e))),
        };
        let output = install.take_output();
        let code = tokio::select! {
            _ = cancel.cancelled() => {
                let code = install.terminate().await;
                tracing::debug!("`{}` interrupted ({})", install.command(), code);
                return Ok(self.interrupted());
            }
            (_, code) = async {
                tokio::join!(
                    pump_lines(output, Stage::Install, self.log_tx.clone()),
                    install.wait()
                )
            } => code,
        };
        if code != 0 {
            let err = CollabError::Process {
                command: install.command().to_string(),
                code,
            };
            return Ok(self.fail(err.to_string()));
        }

        let ready_rx = self.runtime.subscribe_ready();
        let process = match self.runtime.spawn(&self.start_command).await {
            Ok(process) => process,
            Err(e) => return Ok(self.fail(format!("{:#}", e))),
        };
        self.set_status(RunStatus::Running);

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = Supervisor {
            generation,
            current: Arc::clone(&self.generation),
            status_tx: Arc::clone(&self.status_tx),
            preview_tx: Arc::clone(&self.preview_tx),
            log_tx: self.log_tx.clone(),
        };
        *active = Some(ActiveRun {
            kill_tx: Some(kill_tx),
            supervisor: tokio::spawn(supervisor.watch(process, ready_rx, kill_rx)),
        });

        Ok(RunStatus::Running)
    }

    /// Terminate the active run, if any, and move to [`RunStatus::Stopped`].
    ///
    /// Interrupts a run that is still mounting or installing. Idempotent.
    pub async fn stop(&self) -> RunStatus {
        self.setup().cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut active = self.active.lock().await;
        if let Some(run) = active.take() {
            run.terminate().await;
            tracing::info!("run stopped");
        }
        self.preview_tx.send_replace(None);
        self.set_status(RunStatus::Stopped);
        RunStatus::Stopped
    }

    /// Record a server-ready announcement delivered over the channel.
    ///
    /// Ignored unless a run is in progress.
    pub fn observe_preview(&self, address: PreviewAddress) {
        if self.status() == RunStatus::Running {
            tracing::info!("preview available at {}", address.url);
            self.preview_tx.send_replace(Some(address));
        }
    }

    fn setup(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.setup.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: RunStatus) {
        tracing::debug!("run status -> {}", status);
        self.status_tx.send_replace(status);
    }

    fn interrupted(&self) -> RunStatus {
        tracing::info!("run interrupted before start");
        RunStatus::Stopped
    }

    fn fail(&self, reason: String) -> RunStatus {
        tracing::warn!("run failed: {}", reason);
        let status = RunStatus::Failed { reason };
        self.set_status(status.clone());
        status
    }
}

struct Supervisor {
    generation: u64,
    current: Arc<AtomicU64>,
    status_tx: Arc<watch::Sender<RunStatus>>,
    preview_tx: Arc<watch::Sender<Option<PreviewAddress>>>,
    log_tx: mpsc::UnboundedSender<LogLine>,
}

impl Supervisor {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    async fn watch(
        self,
        mut process: SandboxProcess,
        mut ready_rx: broadcast::Receiver<PreviewAddress>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let mut pump = tokio::spawn(pump_lines(
            process.take_output(),
            Stage::Run,
            self.log_tx.clone(),
        ));

        let mut ready_open = true;
        let exited = loop {
            tokio::select! {
                _ = &mut kill_rx => break None,
                code = process.wait() => break Some(code),
                ready = ready_rx.recv(), if ready_open => match ready {
                    Ok(address) if self.is_current() => {
                        tracing::info!("preview available at {}", address.url);
                        self.preview_tx.send_replace(Some(address));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => ready_open = false,
                },
            }
        };

        match exited {
            None => {
                let code = process.terminate().await;
                tracing::debug!("`{}` terminated ({})", process.command(), code);
            }
            Some(code) if self.is_current() => {
                let status = if code == 0 {
                    tracing::info!("`{}` exited", process.command());
                    RunStatus::Stopped
                } else {
                    let err = CollabError::Process {
                        command: process.command().to_string(),
                        code,
                    };
                    tracing::warn!("{}", err);
                    RunStatus::Failed {
                        reason: err.to_string(),
                    }
                };
                self.status_tx.send_replace(status);
                self.preview_tx.send_replace(None);
            }
            Some(_) => {}
        }

        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

/// Split raw output into lines and forward them to the log sink.
async fn pump_lines(
    output: Option<OutputStream>,
    stage: Stage,
    log_tx: mpsc::UnboundedSender<LogLine>,
) {
    let Some(output) = output else {
        return;
    };
    let reader = StreamReader::new(output.map(Ok::<_, std::io::Error>));
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LOG_LINE_BYTES));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                tracing::debug!(target: "collabsync::sandbox::output", stage = stage.as_str(), "{}", line);
                let _ = log_tx.send(LogLine { stage, line });
            }
            Err(e) => tracing::warn!("sandbox {} output: {}", stage.as_str(), e),
        }
    }
}
