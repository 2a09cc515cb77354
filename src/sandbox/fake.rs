//! Scripted sandbox runtime for tests
//!
//! Commands are matched by their joined command line. A scripted command
//! prints its lines and then either exits with a fixed code or runs until
//! killed. Every mount, spawn and kill is recorded in order in
//! [`FakeSandbox::events`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use crate::error::{CollabError, Result};
use crate::model::FileTree;
use crate::sandbox::{PreviewAddress, SandboxProcess, SandboxRuntime, KILLED_EXIT_CODE};

#[derive(Debug, Clone)]
struct Script {
    lines: Vec<String>,
    exit: Option<i32>,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, Script>,
    mounts: Vec<FileTree>,
}

/// In-memory [`SandboxRuntime`].
#[derive(Debug)]
pub struct FakeSandbox {
    state: Mutex<State>,
    events: Arc<Mutex<Vec<String>>>,
    ready_tx: broadcast::Sender<PreviewAddress>,
}

impl Default for FakeSandbox {
    fn default() -> Self {
        let (ready_tx, _) = broadcast::channel(8);
        Self {
            state: Mutex::new(State::default()),
            events: Arc::new(Mutex::new(Vec::new())),
            ready_tx,
        }
    }
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// `command` prints `lines` and exits with `code`.
    pub fn script_exit(&self, command: &str, lines: &[&str], code: i32) {
        self.script(command, lines, Some(code));
    }

    /// `command` prints `lines` and runs until killed.
    pub fn script_forever(&self, command: &str, lines: &[&str]) {
        self.script(command, lines, None);
    }

    fn script(&self, command: &str, lines: &[&str], exit: Option<i32>) {
        let script = Script {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit,
        };
        lock(&self.state).scripts.insert(command.to_string(), script);
    }

    /// Announce a listening server to current subscribers.
    pub fn announce_ready(&self, port: u16) {
        let _ = self.ready_tx.send(PreviewAddress {
            port,
            url: format!("http://localhost:{}", port),
        });
    }

    /// Recorded `mount`, `spawn <cmd>`, `kill <cmd>` events in order.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn mounts(&self) -> Vec<FileTree> {
        lock(&self.state).mounts.clone()
    }

    fn record(&self, event: String) {
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait::async_trait]
impl SandboxRuntime for FakeSandbox {
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    async fn mount(&self, tree: &FileTree) -> Result<()> {
        lock(&self.state).mounts.push(tree.clone());
        self.record("mount".to_string());
        Ok(())
    }

    async fn spawn(&self, command: &[String]) -> Result<SandboxProcess> {
        let line = command.join(" ");
        let script = lock(&self.state).scripts.get(&line).cloned().ok_or_else(|| {
            CollabError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no script for `{}`", line),
            ))
        })?;
        self.record(format!("spawn {}", line));

        let output = futures::stream::iter(
            script
                .lines
                .into_iter()
                .map(|l| Bytes::from(format!("{}\n", l))),
        );

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let events = Arc::clone(&self.events);
        let killed = line.clone();
        tokio::spawn(async move {
            match script.exit {
                Some(code) => {
                    let _ = exit_tx.send(code);
                }
                None => {
                    if kill_rx.await.is_ok() {
                        lock(&events).push(format!("kill {}", killed));
                    }
                    let _ = exit_tx.send(KILLED_EXIT_CODE);
                }
            }
        });

        Ok(SandboxProcess::new(line, Box::pin(output), exit_rx, kill_tx))
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<PreviewAddress> {
        self.ready_tx.subscribe()
    }
}
