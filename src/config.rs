//! Configuration for the readiness-loop binary and its event loops.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::Framing;
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "readiness-loop")]
#[command(version = "0.1.0")]
#[command(about = "Ping/pong over a readiness-driven event loop", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind and connect to
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to bind and connect to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-channel read buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// How long the client waits for its connection to complete
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Delay between a reply and the next request
    #[arg(short, long)]
    pub delay_ms: Option<u64>,

    /// Message framing (raw, line, length)
    #[arg(short, long)]
    pub framing: Option<Framing>,

    /// Stop after this many replies (0 = run until killed)
    #[arg(short, long)]
    pub rounds: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Read buffer size per channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Capacity of the ready-event batch per `wait()`
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Client-side settings
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub rounds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            delay_ms: default_delay_ms(),
            rounds: 0,
        }
    }
}

/// Payload policy
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_request")]
    pub request: String,
    #[serde(default = "default_reply")]
    pub reply: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            request: default_request(),
            reply: default_reply(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
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
    8080
}

fn default_buffer_size() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    128
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_request() -> String {
    "PING".to_string()
}

fn default_reply() -> String {
    "PONG".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub event_capacity: usize,
    pub connect_timeout: Duration,
    pub delay: Duration,
    pub rounds: u64,
    pub framing: Framing,
    pub request: Vec<u8>,
    pub reply: Vec<u8>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        if config.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero"));
        }
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.server.buffer_size),
            event_capacity: toml_config.server.event_capacity.max(1),
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms
                    .unwrap_or(toml_config.client.connect_timeout_ms),
            ),
            delay: Duration::from_millis(cli.delay_ms.unwrap_or(toml_config.client.delay_ms)),
            rounds: cli.rounds.unwrap_or(toml_config.client.rounds),
            framing: cli.framing.unwrap_or(toml_config.protocol.framing),
            request: toml_config.protocol.request.into_bytes(),
            reply: toml_config.protocol.reply.into_bytes(),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Resolve `host:port` to the first socket address.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(target.clone(), e))?
            .next()
            .ok_or(ConfigError::Invalid("host resolved to no addresses"))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Resolve(String, std::io::Error),
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
            ConfigError::Resolve(addr, e) => write!(f, "Failed to resolve '{addr}': {e}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
