//! Handler settings

use portfwd_socket::PipeOwner;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunable behaviour of a [`crate::PortForwardHandler`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Largest chunk read from a local socket into one data message
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Close accepted connections whose destination never answered.
    /// Unset keeps them until explicitly closed.
    #[serde(default)]
    pub pending_timeout_seconds: Option<u64>,

    /// Owner for pipes created for environment-variable forwards
    #[serde(default)]
    pub pipe_owner: Option<PipeOwner>,

    /// Parent of the private pipe directories (defaults to the OS temp dir)
    #[serde(default)]
    pub pipe_directory: Option<PathBuf>,

    /// Give up on a local write that stays blocked this long
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_write_timeout() -> u64 {
    10
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            pending_timeout_seconds: None,
            pipe_owner: None,
            pipe_directory: None,
            write_timeout_seconds: default_write_timeout(),
        }
    }
}

impl HandlerConfig {
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_seconds.map(Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn with_pending_timeout(mut self, seconds: u64) -> Self {
        self.pending_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_pipe_owner(mut self, owner: PipeOwner) -> Self {
        self.pipe_owner = Some(owner);
        self
    }

    pub fn with_pipe_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.pipe_directory = Some(directory.into());
        self
    }
}
