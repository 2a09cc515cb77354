//! Slash commands for the interactive session
//!
//! Lines starting with `/` drive the session instead of being sent as chat
//! messages. Command names are case-insensitive; arguments are kept as
//! typed. `exit` and `quit` without a slash also leave the session.

use thiserror::Error;

/// Errors that can occur when parsing slash commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown command was entered
    #[error("Unknown command: {0}\n\nType '/help' to see available commands")]
    UnknownCommand(String),

    /// Command requires an argument but none was provided
    #[error("Command {command} requires an argument\n\nUsage: {usage}")]
    MissingArgument { command: String, usage: String },
}

/// What one line of input asks the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Plain text for the chat
    Say(String),
    /// Mount the file tree, install and start the project
    Run,
    /// Stop the current run
    Stop,
    /// List the file tree's paths
    Files,
    /// Print one file
    Open(String),
    /// Replace one file's contents and persist the tree
    Edit { path: String, contents: String },
    /// Show the session's collaborators
    Members,
    /// Add users to the session
    Add(Vec<String>),
    /// Remove a user from the session
    Remove(String),
    /// List the user directory
    Users,
    /// Re-read the session from the store
    Reload,
    /// Show session status
    Status,
    Help,
    Quit,
}

/// Parse one line of interactive input
///
/// # Errors
///
/// Returns [`CommandError::UnknownCommand`] for an unrecognised `/word`
/// and [`CommandError::MissingArgument`] when a command lacks its argument.
///
/// # Examples
///
/// ```
/// use collabsync::commands::special_commands::{parse_session_command, SessionCommand};
///
/// assert_eq!(parse_session_command("/run").unwrap(), SessionCommand::Run);
/// assert_eq!(
///     parse_session_command("hello").unwrap(),
///     SessionCommand::Say("hello".to_string())
/// );
/// assert!(parse_session_command("/frobnicate").is_err());
/// ```
pub fn parse_session_command(input: &str) -> Result<SessionCommand, CommandError> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();

    if lower == "exit" || lower == "quit" {
        return Ok(SessionCommand::Quit);
    }
    if !trimmed.starts_with('/') {
        return Ok(SessionCommand::Say(input.to_string()));
    }

    let (name, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((name, rest)) => (name.to_lowercase(), rest.trim()),
        None => (lower, ""),
    };

    match name.as_str() {
        "/run" => Ok(SessionCommand::Run),
        "/stop" => Ok(SessionCommand::Stop),
        "/files" | "/ls" => Ok(SessionCommand::Files),
        "/members" => Ok(SessionCommand::Members),
        "/users" => Ok(SessionCommand::Users),
        "/reload" => Ok(SessionCommand::Reload),
        "/status" => Ok(SessionCommand::Status),
        "/help" | "/?" => Ok(SessionCommand::Help),
        "/quit" | "/exit" => Ok(SessionCommand::Quit),

        "/open" => required(rest, "/open", "/open <path>").map(SessionCommand::Open),
        "/remove" => required(rest, "/remove", "/remove <user_id>").map(SessionCommand::Remove),
        "/add" => {
            let ids: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
            if ids.is_empty() {
                return Err(missing("/add", "/add <user_id>..."));
            }
            Ok(SessionCommand::Add(ids))
        }
        "/edit" => {
            let Some((path, contents)) = rest.split_once(char::is_whitespace) else {
                return Err(missing("/edit", "/edit <path> <contents>"));
            };
            Ok(SessionCommand::Edit {
                path: path.to_string(),
                contents: unescape(contents.trim_start()),
            })
        }

        _ => Err(CommandError::UnknownCommand(name)),
    }
}

fn required(rest: &str, command: &str, usage: &str) -> Result<String, CommandError> {
    if rest.is_empty() {
        Err(missing(command, usage))
    } else {
        Ok(rest.to_string())
    }
}

fn missing(command: &str, usage: &str) -> CommandError {
    CommandError::MissingArgument {
        command: command.to_string(),
        usage: usage.to_string(),
    }
}

/// `\n` and `\t` in typed contents become real newlines and tabs.
fn unescape(contents: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    let mut chars = contents.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Print the slash command reference
pub fn print_help() {
    println!(
        r#"
Session Commands:

  /run                      Mount the file tree, install and start the project
  /stop                     Stop the running project
  /files                    List the shared file tree
  /open <path>              Print a file
  /edit <path> <contents>   Replace a file (\n for newlines) and save the tree
  /members                  Show collaborators
  /add <user_id>...         Add collaborators
  /remove <user_id>         Remove a collaborator
  /users                    List every known user
  /reload                   Re-read the session from the store
  /status                   Show connection and sandbox status
  /help                     Show this help
  /quit                     Leave the session

Anything else is sent to the chat.
"#
    );
}
