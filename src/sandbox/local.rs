//! Local child-process sandbox
//!
//! Mounts the file tree into a scratch directory (a fresh temporary
//! directory unless `sandbox.workdir` is set) and runs commands there with
//! `tokio::process`. Readiness is detected by matching each complete output
//! line against `sandbox.ready_pattern`; capture group 1 is the port.
//!
//! A mount only removes files that an earlier mount wrote, so pointing
//! `workdir` at an existing directory never deletes unrelated files.
//!
//! On Unix every command leads its own process group. Killing a process
//! signals the whole group (SIGTERM, then SIGKILL after a grace period), so
//! servers forked by `npm start` and the like end with it.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio_util::io::ReaderStream;

use crate::config::SandboxConfig;
use crate::error::{CollabError, Result};
use crate::model::FileTree;
use crate::sandbox::{PreviewAddress, SandboxProcess, SandboxRuntime, KILLED_EXIT_CODE};

/// How long a process group gets to exit on SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Runs commands as local child processes.
///
/// # Examples
///
/// ```
/// use collabsync::model::{FileEntry, FileTree};
/// use collabsync::sandbox::{LocalSandbox, SandboxRuntime};
///
/// # tokio_test::block_on(async {
/// let sandbox = LocalSandbox::new(None, r"localhost:(\d+)")?;
/// let mut tree = FileTree::new();
/// tree.insert("src/index.js".to_string(), FileEntry::new("console.log(1)"));
/// sandbox.mount(&tree).await?;
/// assert!(sandbox.root().join("src/index.js").exists());
/// # Ok::<(), anyhow::Error>(())
/// # }).unwrap();
/// ```
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    _scratch: Option<tempfile::TempDir>,
    ready_pattern: Regex,
    ready_tx: broadcast::Sender<PreviewAddress>,
    mounted: Mutex<BTreeSet<PathBuf>>,
}

impl LocalSandbox {
    /// Create a sandbox rooted at `workdir`, or at a new temporary
    /// directory that is removed when the sandbox is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CollabError::Config`] for an invalid `ready_pattern` and
    /// [`CollabError::Io`] if the directory cannot be created.
    pub fn new(workdir: Option<PathBuf>, ready_pattern: &str) -> Result<Self> {
        let ready_pattern = Regex::new(ready_pattern).map_err(|e| {
            CollabError::Config(format!("sandbox.ready_pattern is not a valid regex: {}", e))
        })?;

        let (root, scratch) = match workdir {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(CollabError::Io)?;
                (dir, None)
            }
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("collabsync-")
                    .tempdir()
                    .map_err(CollabError::Io)?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };
        tracing::debug!("local sandbox rooted at {}", root.display());

        let (ready_tx, _) = broadcast::channel(8);
        Ok(Self {
            root,
            _scratch: scratch,
            ready_pattern,
            ready_tx,
            mounted: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        Self::new(config.workdir.clone(), &config.ready_pattern)
    }

    /// Directory the tree is mounted into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mounted(&self) -> std::sync::MutexGuard<'_, BTreeSet<PathBuf>> {
        self.mounted.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Validate a tree path and return it relative to the sandbox root.
fn relative_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CollabError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("file tree path escapes the sandbox: {}", path),
                ))
                .into())
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(CollabError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("empty file tree path: {:?}", path),
        ))
        .into());
    }
    Ok(relative)
}

/// Extract a preview address from one output line.
pub(crate) fn parse_ready(pattern: &Regex, line: &str) -> Option<PreviewAddress> {
    let captures = pattern.captures(line)?;
    let port = captures.get(1)?.as_str().parse::<u16>().ok()?;
    Some(PreviewAddress {
        port,
        url: format!("http://localhost:{}", port),
    })
}

/// Splits raw output into lines and announces the first ready match.
struct ReadyScanner {
    pattern: Regex,
    ready_tx: broadcast::Sender<PreviewAddress>,
    pending: String,
    announced: bool,
}

impl ReadyScanner {
    fn feed(&mut self, chunk: &Bytes) {
        if self.announced {
            return;
        }
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            if let Some(address) = parse_ready(&self.pattern, &line) {
                tracing::info!("sandbox server ready at {}", address.url);
                let _ = self.ready_tx.send(address);
                self.announced = true;
                self.pending.clear();
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl SandboxRuntime for LocalSandbox {
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn mount(&self, tree: &FileTree) -> Result<()> {
        let files = tree
            .iter()
            .map(|(path, entry)| Ok((relative_path(path)?, entry.contents.as_str())))
            .collect::<Result<Vec<_>>>()?;
        let next: BTreeSet<PathBuf> = files.iter().map(|(path, _)| path.clone()).collect();

        let stale: Vec<PathBuf> = self.mounted().difference(&next).cloned().collect();
        for path in stale {
            match tokio::fs::remove_file(self.root.join(&path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CollabError::Io(e).into()),
            }
        }

        for (path, contents) in &files {
            let target = self.root.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(CollabError::Io)?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(CollabError::Io)?;
        }

        tracing::debug!("mounted {} files into {}", files.len(), self.root.display());
        *self.mounted() = next;
        Ok(())
    }

    async fn spawn(&self, command: &[String]) -> Result<SandboxProcess> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CollabError::Config("sandbox command is empty".to_string()))?;
        let line = command.join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::Error::from(CollabError::Io(e)).context(format!("failed to spawn `{}`", line))
        })?;
        let pgid = child.id();
        tracing::debug!("spawned `{}` in {}", line, self.root.display());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CollabError::Config("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CollabError::Config("child stderr unavailable after spawn".into()))?;

        let mut scanner = ReadyScanner {
            pattern: self.ready_pattern.clone(),
            ready_tx: self.ready_tx.clone(),
            pending: String::new(),
            announced: false,
        };
        let output = futures::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr))
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::debug!("sandbox output read failed: {}", e);
                        None
                    }
                }
            })
            .inspect(move |chunk| scanner.feed(chunk));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let supervised = line.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                _ = kill_rx => {
                    tracing::debug!("killing `{}`", supervised);
                    terminate_group(&mut child, pgid).await
                }
                status = child.wait() => status,
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(KILLED_EXIT_CODE),
                Err(e) => {
                    tracing::warn!("waiting for `{}` failed: {}", supervised, e);
                    KILLED_EXIT_CODE
                }
            };
            tracing::debug!("`{}` exited with {}", supervised, code);
            let _ = exit_tx.send(code);
        });

        Ok(SandboxProcess::new(line, Box::pin(output), exit_rx, kill_tx))
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<PreviewAddress> {
        self.ready_tx.subscribe()
    }
}

/// Terminate `child` and every process in its group, then reap `child`.
async fn terminate_group(child: &mut Child, pgid: Option<u32>) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGTERM);
            let status = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    signal_group(pgid, libc::SIGKILL);
                    child.wait().await
                }
            };
            // Stragglers that ignored SIGTERM.
            signal_group(pgid, libc::SIGKILL);
            return status;
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;

    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: pgid is the id of a child spawned as its own process group leader.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!("signal {} to process group {} failed: {}", signal, pgid, err);
        }
    }
}
