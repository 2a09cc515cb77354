//! Sandbox run command
//!
//! Fetches a project's file tree and runs it in the sandbox, streaming
//! install and run output to stdout line by line until the run ends or the
//! user presses Ctrl-C, which also interrupts a pending install. Sandbox availability is checked before any network I/O so a
//! production deployment fails fast with the reason.

use std::path::PathBuf;

use colored::Colorize;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::sandbox::{
    ensure_available, runtime_from_config, LogLine, RunStatus, SandboxOrchestrator, Stage,
};

use super::{build_store, settle_run};

/// Run a project in the sandbox
///
/// # Arguments
///
/// * `config` - Global configuration (consumed)
/// * `project` - Project whose file tree is run
/// * `workdir` - Mount directory override for `sandbox.workdir`
///
/// # Errors
///
/// Returns [`crate::error::CollabError::SandboxUnavailable`] when the
/// deployment cannot run projects, a persistence error if the project
/// cannot be fetched, and an error carrying the failure reason when the run
/// ends in [`RunStatus::Failed`].
pub async fn run_project(config: Config, project: String, workdir: Option<PathBuf>) -> Result<()> {
    let mut sandbox_config = config.sandbox.clone();
    if workdir.is_some() {
        sandbox_config.workdir = workdir;
    }

    let runtime = runtime_from_config(&sandbox_config)?;
    ensure_available(runtime.as_ref())?;

    let store = build_store(&config)?;
    let session = store.get_project(&project).await?;
    tracing::info!(
        "running project {} ({} files)",
        session.id,
        session.file_tree.len()
    );

    let (orchestrator, mut logs) = SandboxOrchestrator::from_config(runtime, &sandbox_config);
    let mut status_rx = orchestrator.watch_status();
    let mut preview_rx = orchestrator.watch_preview();

    let tree = session.file_tree;
    let mut starting = Some(tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(&tree).await }
    }));

    let outcome = loop {
        tokio::select! {
            started = settle_run(&mut starting), if starting.is_some() => {
                starting = None;
                let status = match started? {
                    RunStatus::Running => orchestrator.status(),
                    settled => settled,
                };
                if !status.is_active() {
                    break status;
                }
            }
            Some(log) = logs.recv() => print_log(&log),
            Ok(()) = preview_rx.changed() => {
                if let Some(address) = preview_rx.borrow_and_update().clone() {
                    println!("{} {}", "preview:".green().bold(), address.url);
                }
            }
            Ok(()) = status_rx.changed() => {
                let status = status_rx.borrow_and_update().clone();
                println!("{} {}", "sandbox:".bold(), status);
                if starting.is_none() && !status.is_active() {
                    break status;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                let stopped = orchestrator.stop().await;
                println!("{} {}", "sandbox:".bold(), stopped);
                break stopped;
            }
        }
    };

    drain_logs(&mut logs);

    match outcome {
        RunStatus::Failed { reason } => {
            tracing::error!("run failed: {}", reason);
            Err(anyhow::anyhow!("run failed: {}", reason))
        }
        _ => Ok(()),
    }
}

fn drain_logs(logs: &mut mpsc::UnboundedReceiver<LogLine>) {
    while let Ok(log) = logs.try_recv() {
        print_log(&log);
    }
}

pub(crate) fn print_log(log: &LogLine) {
    let tag = match log.stage {
        Stage::Install => "[install]".yellow(),
        Stage::Run => "[run]".cyan(),
    };
    println!("{} {}", tag, log.line);
}
