//! collabsync - collaborative session client
//!
#![doc = "collabsync - collaborative session client"]
#![doc = "Main entry point for the collabsync command-line client."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use collabsync::cli::{Cli, Commands};
use collabsync::commands;
use collabsync::config::Config;
use collabsync::model::User;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration; the log format is part of it
    let config_path = cli.config.as_deref().unwrap_or("config/collabsync.yaml");
    let config = Config::load(config_path, &cli)?;

    init_tracing(cli.verbose, config.logging.json);

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Chat {
            project,
            user_id,
            email,
        } => {
            tracing::debug!("Entering project {} as {}", project, email);
            commands::chat::run_chat(config, project, User::new(user_id, email)).await?;
            Ok(())
        }
        Commands::Run { project, workdir } => {
            tracing::info!("Starting sandbox run");
            if let Some(dir) = &workdir {
                tracing::debug!("Mounting into {}", dir.display());
            }
            commands::run::run_project(config, project, workdir).await?;
            Ok(())
        }
        Commands::Members { command } => {
            commands::members::run_members(config, command).await?;
            Ok(())
        }
        Commands::Users => {
            commands::users::run_users(config).await?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// `RUST_LOG` wins over the default level; `--verbose` raises the default
/// to debug. Logs go to stderr so they do not interleave with session
/// output on stdout.
fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose {
        "collabsync=debug"
    } else {
        "collabsync=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
