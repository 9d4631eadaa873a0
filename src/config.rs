//! Configuration module for the framed-server binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::server::ServerConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "framed-server")]
#[command(author = "framed-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed request/response TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host or address to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Run the accept loop on the main thread
    #[arg(long)]
    pub inline: bool,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum request body size in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Reply with the request body instead of the default payload
    #[arg(long)]
    pub echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub framing: FramingSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub inline: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How often idle loops re-check the shutdown flags, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            inline: false,
            max_connections: default_max_connections(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct FramingSection {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub echo: bool,
}

impl Default for FramingSection {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            echo: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub inline: bool,
    pub max_connections: usize,
    pub poll_interval_ms: u64,
    pub max_body_size: usize,
    pub echo: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            inline: cli.inline || toml_config.server.inline,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            poll_interval_ms: toml_config.server.poll_interval_ms,
            max_body_size: cli
                .max_body_size
                .unwrap_or(toml_config.framing.max_body_size),
            echo: cli.echo || toml_config.framing.echo,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }

    /// Runtime settings for the server core.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            backlog: self.backlog,
            run_inline: self.inline,
            max_connections: self.max_connections,
            max_body_size: self.max_body_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("framed-server").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.server.backlog, 1024);
        assert!(!config.server.inline);
        assert_eq!(config.framing.max_body_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            backlog = 128
            inline = true
            poll_interval_ms = 20

            [framing]
            max_body_size = 4096
            echo = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 128);
        assert!(config.server.inline);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.server.poll_interval_ms, 20);
        assert_eq!(config.framing.max_body_size, 4096);
        assert!(config.framing.echo);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("framed-server-{}.toml", std::process::id()));
        std::fs::write(&path, "[server]\nport = 9000\nbacklog = 128\n").unwrap();

        let config = Config::from_args(cli(&[
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9100",
            "--echo",
        ]))
        .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.backlog, 128);
        assert!(config.echo);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_server_config_conversion() {
        let config = Config::from_args(cli(&["-p", "0", "--inline", "--max-connections", "3"]))
            .unwrap();
        let server = config.server_config();

        assert_eq!(server.port, 0);
        assert!(server.run_inline);
        assert_eq!(server.max_connections, 3);
        assert_eq!(server.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_args(cli(&["--max-connections", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_reported() {
        let err = Config::from_args(cli(&["--config", "/nonexistent/framed-server.toml"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }
}
