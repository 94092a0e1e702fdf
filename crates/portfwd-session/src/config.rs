//! Session configuration file (YAML)
//!
//! ```yaml
//! server: relay.example.com:2022
//! tunnels:
//!   - "8080:80"
//!   - "127.0.0.1:5432:db.internal:5432"
//! reverse_tunnels:
//!   - "SSH_AUTH_SOCK:/run/user/1000/agent.sock"
//! poll_interval_ms: 10
//! handler:
//!   read_buffer_size: 16384
//!   pending_timeout_seconds: 30
//! ```

use portfwd_handler::HandlerConfig;
use portfwd_proto::{parse_ranges_to_requests, SourceRequest, TunnelParseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid tunnel '{argument}': {source}")]
    Tunnel {
        argument: String,
        source: TunnelParseError,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Address of the `serve` side, required to connect
    #[serde(default)]
    pub server: Option<String>,

    /// Address the `serve` side accepts sessions on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Forward tunnels: listen here, connect on the peer
    #[serde(default)]
    pub tunnels: Vec<String>,

    /// Reverse tunnels: listen on the peer, connect here
    #[serde(default)]
    pub reverse_tunnels: Vec<String>,

    /// How often local sockets are polled for new connections and data
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub handler: HandlerConfig,
}

fn default_listen() -> String {
    "0.0.0.0:2022".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: None,
            listen: default_listen(),
            tunnels: Vec::new(),
            reverse_tunnels: Vec::new(),
            poll_interval_ms: default_poll_interval(),
            handler: HandlerConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values and make sure every tunnel argument parses
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.handler.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "handler.read_buffer_size must be greater than zero".to_string(),
            ));
        }
        self.forward_requests()?;
        self.reverse_requests()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn forward_requests(&self) -> Result<Vec<SourceRequest>, ConfigError> {
        parse_all(&self.tunnels)
    }

    pub fn reverse_requests(&self) -> Result<Vec<SourceRequest>, ConfigError> {
        parse_all(&self.reverse_tunnels)
    }
}

fn parse_all(arguments: &[String]) -> Result<Vec<SourceRequest>, ConfigError> {
    let mut requests = Vec::new();
    for argument in arguments {
        let parsed = parse_ranges_to_requests(argument).map_err(|source| ConfigError::Tunnel {
            argument: argument.clone(),
            source,
        })?;
        requests.extend(parsed);
    }
    Ok(requests)
}
