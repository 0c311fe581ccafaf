//! Cluster lifecycle configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_timeout, Validatable};

/// Worker count, handshake and shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of worker processes to spawn
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long the controller waits for a worker's transfer handshake
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,

    /// How long a worker gets to exit after `terminate` before it is killed
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,

    /// How long a worker waits to connect to the rendezvous socket
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_worker_timeout"
    )]
    pub worker_timeout: Duration,

    /// Whether workers get a transfer connection for listening sockets
    #[serde(default = "crate::domains::utils::default_true")]
    pub share_sockets: bool,

    /// Directory for the rendezvous socket (system temp dir when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_dir: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            connect_timeout: default_connect_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            worker_timeout: default_worker_timeout(),
            share_sockets: true,
            rendezvous_dir: None,
        }
    }
}

impl ClusterConfig {
    /// Directory the rendezvous socket is created in
    pub fn rendezvous_dir(&self) -> PathBuf {
        self.rendezvous_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Validatable for ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.workers, "workers", self.domain_name())?;
        validate_timeout(self.connect_timeout, "connect_timeout", self.domain_name())?;
        validate_timeout(self.shutdown_timeout, "shutdown_timeout", self.domain_name())?;
        validate_timeout(self.worker_timeout, "worker_timeout", self.domain_name())?;

        if let Some(dir) = &self.rendezvous_dir {
            if !dir.is_absolute() {
                return Err(self.validation_error(format!(
                    "rendezvous_dir must be an absolute path, got {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "cluster"
    }
}

// Default value functions
fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_worker_timeout() -> Duration {
    Duration::from_millis(5000)
}
