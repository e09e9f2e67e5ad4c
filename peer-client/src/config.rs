//! Peer configuration
//!
//! ```text
//! peer-client [--config <path>] [--server <addr:port>] [--name <name>]
//!             [--identity <path>] [--downloads <dir>]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use punch_core::signaling::millis;
use punch_core::{AckPolicy, DEFAULT_PORT_OFFSET, HOLE_PUNCH_TIMEOUT};
use serde::{Deserialize, Serialize};

/// Default rendezvous server address
pub const DEFAULT_SERVER: &str = "127.0.0.1:7000";

/// Connect timeout for the control connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the server's answer to our registration
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub server_addr: SocketAddr,
    /// Overrides the name stored in the identity file
    pub name: Option<String>,
    pub identity_path: PathBuf,
    pub download_dir: PathBuf,
    /// Added to control-channel ports to get punch ports; identical on every peer
    pub port_offset: u16,
    #[serde(with = "millis")]
    pub punch_timeout: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub registration_timeout: Duration,
    pub ack: AckPolicy,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            name: None,
            identity_path: default_identity_path(),
            download_dir: PathBuf::from("downloads"),
            port_offset: DEFAULT_PORT_OFFSET,
            punch_timeout: HOLE_PUNCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            ack: AckPolicy::default(),
        }
    }
}

/// `~/.config/holepunch/identity.json`, or the working directory without a home
fn default_identity_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config").join("holepunch"))
        .unwrap_or_default()
        .join("identity.json")
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

impl PeerConfig {
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

        if let Some(server) = parse_arg(args, "--server") {
            config.server_addr = server.parse().map_err(|_| ConfigError::InvalidArg {
                flag: "--server".into(),
                value: server.clone(),
            })?;
        }
        if let Some(name) = parse_arg(args, "--name") {
            config.name = Some(name);
        }
        if let Some(path) = parse_arg(args, "--identity") {
            config.identity_path = PathBuf::from(path);
        }
        if let Some(dir) = parse_arg(args, "--downloads") {
            config.download_dir = PathBuf::from(dir);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("peer-client")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_default_server() {
        let config = PeerConfig::default();
        assert_eq!(config.server_addr, DEFAULT_SERVER.parse().unwrap());
        assert_eq!(config.port_offset, DEFAULT_PORT_OFFSET);
        assert_eq!(config.punch_timeout, HOLE_PUNCH_TIMEOUT);
    }

    #[test]
    fn test_flag_overrides() {
        let config = PeerConfig::from_args(&args(&[
            "--server",
            "10.0.0.100:7000",
            "--name",
            "Client 1",
            "--downloads",
            "/tmp/in",
        ]))
        .unwrap();

        assert_eq!(config.server_addr, "10.0.0.100:7000".parse().unwrap());
        assert_eq!(config.name.as_deref(), Some("Client 1"));
        assert_eq!(config.download_dir, PathBuf::from("/tmp/in"));
    }

    #[test]
    fn test_bad_server_flag() {
        assert!(matches!(
            PeerConfig::from_args(&args(&["--server", "localhost"])),
            Err(ConfigError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_json_overrides_offset() {
        let config: PeerConfig =
            serde_json::from_str(r#"{"port_offset": 0, "punch_timeout": 2500}"#).unwrap();
        assert_eq!(config.port_offset, 0);
        assert_eq!(config.punch_timeout, Duration::from_millis(2500));
        assert_eq!(config.ack, AckPolicy::default());
    }
}
