//! Configuration management for collabsync
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// Main configuration structure for collabsync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store and channel endpoints plus credential
    #[serde(default)]
    pub server: ServerConfig,
    /// Channel transport negotiation and reconnection
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Sandbox runtime settings
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store and channel endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the project store (request/response API)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL of the event channel
    #[serde(default = "default_socket_url")]
    pub socket_url: String,

    /// Opaque bearer credential sent with every request and connection
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout for store calls (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_socket_url() -> String {
    "ws://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            socket_url: default_socket_url(),
            token: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Channel transport kinds, in negotiation order when listed in config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent duplex WebSocket
    Websocket,
    /// HTTP request/poll framing
    Polling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Websocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = CollabError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "polling" | "poll" => Ok(TransportKind::Polling),
            other => Err(CollabError::Config(format!(
                "Unknown transport: {}. Must be one of: websocket, polling",
                other
            ))),
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Transports to try, most preferred first
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    /// Interval between polls for the polling transport (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Re-negotiation attempts after the channel drops
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Backoff step between reconnect attempts (milliseconds)
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Websocket, TransportKind::Polling]
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff() -> u64 {
    500
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transports: default_transports(),
            poll_interval_ms: default_poll_interval(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff(),
        }
    }
}

/// Deployment context; production disables the sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    #[default]
    Development,
    Production,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Deployment context the client runs in
    #[serde(default)]
    pub deployment: Deployment,

    /// Master switch for sandbox execution
    #[serde(default = "default_sandbox_enabled")]
    pub enabled: bool,

    /// Directory the file tree is mounted into (temp dir when unset)
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Dependency installation command
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,

    /// Command that starts the project
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,

    /// Regex matched against run output; capture group 1 is the port
    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: String,
}

fn default_sandbox_enabled() -> bool {
    true
}

fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_start_command() -> Vec<String> {
    vec!["npm".to_string(), "start".to_string()]
}

fn default_ready_pattern() -> String {
    r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d+)".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            deployment: Deployment::default(),
            enabled: default_sandbox_enabled(),
            workdir: None,
            install_command: default_install_command(),
            start_command: default_start_command(),
            ready_pattern: default_ready_pattern(),
        }
    }
}

impl SandboxConfig {
    /// Why the sandbox cannot run here, or `None` when it can.
    pub fn unavailable_reason(&self) -> Option<String> {
        if self.deployment == Deployment::Production {
            return Some("sandbox execution is disabled in production deployments".to_string());
        }
        if !self.enabled {
            return Some("sandbox execution is disabled by configuration (sandbox.enabled = false)".to_string());
        }
        None
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars()?;
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CollabError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(api_url) = std::env::var("COLLABSYNC_API_URL") {
            self.server.api_url = api_url;
        }

        if let Ok(socket_url) = std::env::var("COLLABSYNC_SOCKET_URL") {
            self.server.socket_url = socket_url;
        }

        if let Ok(token) = std::env::var("COLLABSYNC_TOKEN") {
            self.server.token = Some(token);
        }

        if let Ok(transports) = std::env::var("COLLABSYNC_TRANSPORTS") {
            self.channel.transports = transports
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }

        if let Ok(deployment) = std::env::var("COLLABSYNC_DEPLOYMENT") {
            self.sandbox.deployment = match deployment.to_ascii_lowercase().as_str() {
                "production" | "prod" => Deployment::Production,
                "development" | "dev" => Deployment::Development,
                other => {
                    return Err(CollabError::Config(format!(
                        "Invalid COLLABSYNC_DEPLOYMENT: {}",
                        other
                    ))
                    .into())
                }
            };
        }

        if let Ok(enabled) = std::env::var("COLLABSYNC_SANDBOX_ENABLED") {
            self.sandbox.enabled = matches!(enabled.as_str(), "1" | "true" | "yes" | "on");
        }

        if let Ok(workdir) = std::env::var("COLLABSYNC_SANDBOX_WORKDIR") {
            self.sandbox.workdir = Some(PathBuf::from(workdir));
        }

        Ok(())
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
        if let Some(token) = &cli.token {
            self.server.token = Some(token.clone());
        }
        if let Some(api_url) = &cli.api_url {
            self.server.api_url = api_url.clone();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.server.api_url).map_err(|e| {
            CollabError::Config(format!("Invalid server.api_url {}: {}", self.server.api_url, e))
        })?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(CollabError::Config(format!(
                "server.api_url must use http or https, got {}",
                api.scheme()
            ))
            .into());
        }

        let socket = url::Url::parse(&self.server.socket_url).map_err(|e| {
            CollabError::Config(format!(
                "Invalid server.socket_url {}: {}",
                self.server.socket_url, e
            ))
        })?;
        if !matches!(socket.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(CollabError::Config(format!(
                "server.socket_url must use ws, wss, http or https, got {}",
                socket.scheme()
            ))
            .into());
        }

        if self.server.request_timeout_seconds == 0 {
            return Err(CollabError::Config(
                "server.request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.channel.transports.is_empty() {
            return Err(CollabError::Config(
                "channel.transports must list at least one transport".to_string(),
            )
            .into());
        }

        if self.channel.poll_interval_ms == 0 {
            return Err(CollabError::Config(
                "channel.poll_interval_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.sandbox.install_command.is_empty() || self.sandbox.start_command.is_empty() {
            return Err(CollabError::Config(
                "sandbox.install_command and sandbox.start_command cannot be empty".to_string(),
            )
            .into());
        }

        regex::Regex::new(&self.sandbox.ready_pattern).map_err(|e| {
            CollabError::Config(format!("sandbox.ready_pattern is not a valid regex: {}", e))
        })?;

        Ok(())
    }

    /// Per-request timeout for store calls
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.server.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.api_url, "http://localhost:3000");
        assert_eq!(
            config.channel.transports,
            vec![TransportKind::Websocket, TransportKind::Polling]
        );
        assert_eq!(config.sandbox.install_command, vec!["npm", "install"]);
        assert!(config.sandbox.unavailable_reason().is_none());
    }

    #[test]
    fn test_config_validation_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_bad_api_scheme() {
        let mut config = Config::default();
        config.server.api_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_transports() {
        let mut config = Config::default();
        config.channel.transports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_ready_pattern() {
        let mut config = Config::default();
        config.sandbox.ready_pattern = "(unclosed".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ready_pattern"));
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
server:
  api_url: https://api.example.com
  socket_url: wss://api.example.com
  token: abc
channel:
  transports: [polling]
sandbox:
  deployment: production
  start_command: [node, index.js]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.token.as_deref(), Some("abc"));
        assert_eq!(config.channel.transports, vec![TransportKind::Polling]);
        assert_eq!(config.sandbox.start_command, vec!["node", "index.js"]);
        assert_eq!(config.sandbox.install_command, vec!["npm", "install"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_deployment_explains_unavailability() {
        let mut config = SandboxConfig::default();
        config.deployment = Deployment::Production;
        let reason = config.unavailable_reason().unwrap();
        assert!(reason.contains("production"));

        let mut config = SandboxConfig::default();
        config.enabled = false;
        assert!(config.unavailable_reason().unwrap().contains("sandbox.enabled"));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::Websocket);
        assert_eq!(
            " Polling ".parse::<TransportKind>().unwrap(),
            TransportKind::Polling
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_overrides() {
        std::env::set_var("COLLABSYNC_TOKEN", "env-token");
        std::env::set_var("COLLABSYNC_TRANSPORTS", "polling,websocket");
        std::env::set_var("COLLABSYNC_DEPLOYMENT", "production");

        let mut config = Config::default();
        let result = config.apply_env_vars();

        std::env::remove_var("COLLABSYNC_TOKEN");
        std::env::remove_var("COLLABSYNC_TRANSPORTS");
        std::env::remove_var("COLLABSYNC_DEPLOYMENT");

        result.unwrap();
        assert_eq!(config.server.token.as_deref(), Some("env-token"));
        assert_eq!(
            config.channel.transports,
            vec![TransportKind::Polling, TransportKind::Websocket]
        );
        assert_eq!(config.sandbox.deployment, Deployment::Production);
    }

    #[test]
    #[serial]
    fn test_apply_env_vars_rejects_unknown_deployment() {
        std::env::set_var("COLLABSYNC_DEPLOYMENT", "staging-ish");
        let mut config = Config::default();
        let result = config.apply_env_vars();
        std::env::remove_var("COLLABSYNC_DEPLOYMENT");
        assert!(result.is_err());
    }
}
