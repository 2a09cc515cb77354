//! Interactive session handler
//!
//! Enters a session through the [`SessionEngine`] and runs a readline
//! prompt beside it. Readline blocks, so it lives on its own thread and
//! hands each line to the async loop, which interleaves user input with
//! channel events, sandbox logs and run status changes. The prompt is only
//! shown again once the previous line has been handled.

use std::sync::Arc;

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ConnectionRegistry, ConnectionState, Negotiator, ReconnectPolicy};
use crate::config::Config;
use crate::error::{collab_error, CollabError, Result};
use crate::model::{ChatEntry, MessageBody, User};
use crate::sandbox::{runtime_from_config, RunStatus, SandboxOrchestrator};
use crate::session::{SessionEngine, SessionEvent};

use super::run::print_log;
use super::special_commands::{parse_session_command, print_help, SessionCommand};
use super::{build_store, print_members, print_users, settle_run};

enum Input {
    Line(String),
    Closed,
    Failed(String),
}

/// Start an interactive session
///
/// # Arguments
///
/// * `config` - Global configuration (consumed)
/// * `project` - Session to enter
/// * `local_user` - The user this client acts as
///
/// # Errors
///
/// Returns [`CollabError::Connection`] if no transport reaches the channel
/// and a persistence error if the session cannot be loaded.
pub async fn run_chat(config: Config, project: String, local_user: User) -> Result<()> {
    tracing::info!("Starting interactive session");

    let store = build_store(&config)?;
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::new(Negotiator::from_config(&config)),
        ReconnectPolicy::from_config(&config.channel),
    ));
    let runtime = runtime_from_config(&config.sandbox)?;
    let (orchestrator, mut logs) = SandboxOrchestrator::from_config(runtime, &config.sandbox);
    let mut status_rx = orchestrator.watch_status();

    let mut engine = SessionEngine::enter(&project, local_user, store, registry, orchestrator).await?;

    print_welcome_banner(&engine);
    for entry in engine.history() {
        print_entry(entry);
    }

    let prompt = format!("{}> ", engine.local_user().email);
    let (mut lines, ready_tx) = spawn_reader(prompt);
    let mut starting: Option<JoinHandle<Result<RunStatus>>> = None;

    loop {
        tokio::select! {
            input = lines.recv() => match input {
                Some(Input::Line(line)) => {
                    match handle_line(&mut engine, &line, &mut starting).await {
                        Flow::Quit => break,
                        Flow::Continue { restore } => {
                            if ready_tx.send(restore).is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Input::Failed(e)) => {
                    tracing::error!("Readline error: {}", e);
                    break;
                }
                Some(Input::Closed) | None => break,
            },
            inbound = engine.next_inbound() => match inbound {
                Some(inbound) => {
                    for event in engine.apply(inbound).await {
                        print_event(&event);
                    }
                }
                None => break,
            },
            started = settle_run(&mut starting), if starting.is_some() => {
                starting = None;
                if let Err(e) = started {
                    report(&e);
                }
            }
            Some(log) = logs.recv() => print_log(&log),
            Ok(()) = status_rx.changed() => {
                let status = status_rx.borrow_and_update().clone();
                print_status(&status);
            }
        }
    }

    engine.leave().await;
    println!("Goodbye!");
    Ok(())
}

enum Flow {
    /// Prompt again, pre-filled with `restore` when set.
    Continue { restore: Option<String> },
    Quit,
}

impl Flow {
    fn next() -> Self {
        Flow::Continue { restore: None }
    }
}

/// Run readline on a dedicated thread.
///
/// Each line is sent to the returned receiver; the thread then waits on the
/// returned sender before prompting again. Sending `Some(text)` pre-fills
/// the next prompt with `text`. Dropping the sender ends the thread.
fn spawn_reader(
    prompt: String,
) -> (
    mpsc::UnboundedReceiver<Input>,
    mpsc::UnboundedSender<Option<String>>,
) {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Option<String>>();

    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                let _ = line_tx.send(Input::Failed(e.to_string()));
                return;
            }
        };

        let mut initial: Option<String> = None;
        loop {
            let read = match initial.take() {
                Some(text) => rl.readline_with_initial(&prompt, (&text, "")),
                None => rl.readline(&prompt),
            };
            let input = match read {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = rl.add_history_entry(line.as_str());
                    }
                    Input::Line(line)
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Input::Closed,
                Err(e) => Input::Failed(e.to_string()),
            };
            let done = !matches!(input, Input::Line(_));
            if line_tx.send(input).is_err() || done {
                return;
            }
            match ready_rx.blocking_recv() {
                Some(restore) => initial = restore,
                None => return,
            }
        }
    });

    (line_rx, ready_tx)
}

async fn handle_line(
    engine: &mut SessionEngine,
    line: &str,
    starting: &mut Option<JoinHandle<Result<RunStatus>>>,
) -> Flow {
    if line.trim().is_empty() {
        return Flow::next();
    }

    let command = match parse_session_command(line) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            return Flow::next();
        }
    };

    match command {
        SessionCommand::Say(text) => match engine.send_message(&text).await {
            Ok(Some(entry)) => {
                print_entry(&entry);
                Flow::next()
            }
            Ok(None) => Flow::next(),
            Err(e) => {
                eprintln!("{} {:#}", "message not sent:".red(), e);
                Flow::Continue {
                    restore: Some(text),
                }
            }
        },
        SessionCommand::Run => {
            if let Some(reason) = engine.sandbox().unavailable_reason() {
                eprintln!("{} {}", "sandbox unavailable:".yellow(), reason);
                return Flow::next();
            }
            // A newer run supersedes one still starting; the old task
            // settles as stopped on its own.
            *starting = Some(engine.start_run());
            Flow::next()
        }
        SessionCommand::Stop => {
            let status = engine.stop().await;
            print_status(&status);
            Flow::next()
        }
        SessionCommand::Files => {
            let mut any = false;
            for path in engine.files().paths() {
                println!("  {}", path);
                any = true;
            }
            if !any {
                println!("The file tree is empty");
            }
            Flow::next()
        }
        SessionCommand::Open(path) => {
            match engine.files().contents(&path) {
                Some(contents) => println!("{}\n{}", path.bold(), contents),
                None => eprintln!("{} {}", "no such file:".red(), path),
            }
            Flow::next()
        }
        SessionCommand::Edit { path, contents } => {
            match engine.edit_file(&path, &contents).await {
                Ok(()) => println!("{} {}", "saved".green(), path),
                Err(e) => eprintln!(
                    "{} {:#} (the edit is kept locally; /edit again to retry)",
                    "file tree not saved:".red(),
                    e
                ),
            }
            Flow::next()
        }
        SessionCommand::Members => {
            print_members(engine.session());
            Flow::next()
        }
        SessionCommand::Add(ids) => {
            match engine.add_collaborators(&ids).await {
                Ok(session) => print_members(session),
                Err(e) => report(&e),
            }
            Flow::next()
        }
        SessionCommand::Remove(id) => {
            match engine.remove_collaborator(&id).await {
                Ok(session) => print_members(session),
                Err(e) => report(&e),
            }
            Flow::next()
        }
        SessionCommand::Users => {
            match engine.directory().await {
                Ok(users) => print_users(&users),
                Err(e) => report(&e),
            }
            Flow::next()
        }
        SessionCommand::Reload => {
            match engine.reload().await {
                Ok(()) => println!(
                    "reloaded: {} messages, {} files",
                    engine.history().len(),
                    engine.files().tree().len()
                ),
                Err(e) => report(&e),
            }
            Flow::next()
        }
        SessionCommand::Status => {
            print_status_display(engine);
            Flow::next()
        }
        SessionCommand::Help => {
            print_help();
            Flow::next()
        }
        SessionCommand::Quit => Flow::Quit,
    }
}

/// How an error should read to the user.
#[derive(Debug, PartialEq, Eq)]
enum Report {
    /// The sandbox cannot run in this deployment.
    Unavailable(String),
    /// Retrying the same action will fail the same way.
    Terminal(String),
    /// The action can be retried as is.
    Retryable(String),
}

fn classify(err: &anyhow::Error) -> Report {
    match collab_error(err) {
        Some(CollabError::SandboxUnavailable { reason }) => Report::Unavailable(reason.clone()),
        Some(e) if e.is_terminal() => Report::Terminal(e.to_string()),
        _ => Report::Retryable(format!("{:#}", err)),
    }
}

fn report(err: &anyhow::Error) {
    match classify(err) {
        Report::Unavailable(reason) => {
            eprintln!("{} {}", "sandbox unavailable:".yellow(), reason)
        }
        Report::Terminal(text) => eprintln!(
            "{} {} (see /status; /quit and start again once resolved)",
            "error:".red().bold(),
            text
        ),
        Report::Retryable(text) => {
            eprintln!("{} {} (try again)", "error:".red(), text)
        }
    }
}

fn print_entry(entry: &ChatEntry) {
    let sender = if entry.own {
        entry.sender_email().green().bold()
    } else if entry.message.is_from_agent() {
        entry.sender_email().cyan().bold()
    } else {
        entry.sender_email().blue().bold()
    };

    match &entry.body {
        MessageBody::Undecodable { .. } => {
            println!("{}: {}", sender, "[agent reply could not be read]".dimmed())
        }
        body => println!("{}: {}", sender, body.text()),
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Message(entry) => print_entry(entry),
        SessionEvent::FilesMerged { paths } => {
            println!("{} {}", "agent updated:".cyan(), paths.join(", "))
        }
        SessionEvent::Preview(address) => {
            println!("{} {}", "preview:".green().bold(), address.url)
        }
        SessionEvent::Connected { transport } => {
            println!("{}", format!("connected ({})", transport).dimmed())
        }
        SessionEvent::Disconnected { reason } => {
            println!("{} {}", "disconnected:".yellow(), reason)
        }
        SessionEvent::ConnectFailed { message } => {
            println!("{} {}", "reconnect failed:".yellow(), message)
        }
        SessionEvent::Warning(warning) => println!("{} {}", "warning:".yellow(), warning),
    }
}

fn print_status(status: &RunStatus) {
    let text = status.to_string();
    let colored = match status {
        RunStatus::Running => text.green(),
        RunStatus::Failed { .. } => text.red(),
        RunStatus::Stopped | RunStatus::Idle => text.normal(),
        _ => text.yellow(),
    };
    println!("{} {}", "sandbox:".bold(), colored);
}

/// Display the welcome banner with the session's name and collaborators.
fn print_welcome_banner(engine: &SessionEngine) {
    let session = engine.session();
    let title = if session.name.is_empty() {
        session.id.as_str()
    } else {
        session.name.as_str()
    };

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                collabsync - Interactive Session              ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Session: {}", title.bold());
    println!("As:      {}", engine.local_user().email.green());
    println!(
        "Members: {}   Files: {}",
        session.members.len(),
        engine.files().tree().len()
    );
    if let Some(reason) = engine.sandbox().unavailable_reason() {
        println!("Sandbox: {}", reason.yellow());
    }
    println!("\nType '/help' for available commands, '/quit' to leave\n");
}

/// Display connection, sandbox and replica status (`/status`).
fn print_status_display(engine: &SessionEngine) {
    let connection = match engine.connection_state() {
        ConnectionState::Connected(kind) => format!("connected ({})", kind.as_str()).green(),
        ConnectionState::Reconnecting { attempt } => {
            format!("reconnecting (attempt {})", attempt).yellow()
        }
        ConnectionState::Closed => "closed".red(),
    };

    println!("Connection: {}", connection);
    println!("Sandbox:    {}", engine.sandbox().status());
    if let Some(address) = engine.sandbox().preview() {
        println!("Preview:    {}", address.url);
    }
    println!("Messages:   {}", engine.history().len());
    println!(
        "Files:      {}{}",
        engine.files().tree().len(),
        if engine.files().is_dirty() {
            " (unsaved changes)"
        } else {
            ""
        }
    );
}
