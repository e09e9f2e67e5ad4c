//! Server configuration
//!
//! Values come from an optional JSON file and are then overridden by
//! command-line flags:
//!
//! ```text
//! rendezvous-server [--config <path>] [--listen <addr:port>]
//!                   [--session-timeout <secs>] [--prepare-delay <ms>]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use punch_core::signaling::millis;
use punch_core::AckPolicy;
use serde::{Deserialize, Serialize};

/// Default rendezvous port
pub const DEFAULT_PORT: u16 = 7000;

/// Pause between the two PREPARE_HOLE_PUNCH messages
pub const DEFAULT_PREPARE_DELAY: Duration = Duration::from_millis(100);

/// Pending sessions older than this are abandoned
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// A new connection must register within this window
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(with = "millis")]
    pub prepare_delay: Duration,
    #[serde(with = "millis")]
    pub session_timeout: Duration,
    #[serde(with = "millis")]
    pub registration_timeout: Duration,
    pub ack: AckPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            prepare_delay: DEFAULT_PREPARE_DELAY,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            ack: AckPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    InvalidArg { flag: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid config file: {}", e),
            ConfigError::InvalidArg { flag, value } => {
                write!(f, "invalid value {:?} for {}", value, flag)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&text).map_err(ConfigError::Parse)
    }

    /// Build from command-line arguments (program name included)
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(listen) = parse_arg(args, "--listen") {
            config.listen_addr = parse_value("--listen", &listen)?;
        }
        if let Some(secs) = parse_arg(args, "--session-timeout") {
            config.session_timeout = Duration::from_secs(parse_value("--session-timeout", &secs)?);
        }
        if let Some(ms) = parse_arg(args, "--prepare-delay") {
            config.prepare_delay = Duration::from_millis(parse_value("--prepare-delay", &ms)?);
        }

        Ok(config)
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidArg {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rendezvous-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_without_args() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_flag_overrides() {
        let config = ServerConfig::from_args(&args(&[
            "--listen",
            "127.0.0.1:9100",
            "--session-timeout",
            "5",
            "--prepare-delay",
            "0",
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.session_timeout, Duration::from_secs(5));
        assert_eq!(config.prepare_delay, Duration::ZERO);
    }

    #[test]
    fn test_invalid_flag_value() {
        let err = ServerConfig::from_args(&args(&["--listen", "nowhere"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArg { .. }));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"session_timeout": 1500, "ack": {"retries": 5}}"#).unwrap();

        assert_eq!(config.session_timeout, Duration::from_millis(1500));
        assert_eq!(config.ack.retries, 5);
        assert_eq!(config.ack.delay, AckPolicy::default().delay);
        assert_eq!(config.prepare_delay, DEFAULT_PREPARE_DELAY);
    }
}
