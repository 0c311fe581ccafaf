//! Error types for cluster supervision

use std::time::Duration;

use drover_config::ConfigError;
use drover_ipc::IpcError;
use thiserror::Error;

/// Exit code for a worker started with bad arguments
pub const EXIT_USAGE: i32 = 64;

/// Exit code for a worker that could not reach its controller
pub const EXIT_IPC_FAILURE: i32 = 70;

/// Cluster result type
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the supervisor and the worker context
#[derive(Error, Debug)]
pub enum ClusterError {
    /// API misuse: start twice, zero workers, iterate before start...
    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Failed to spawn worker {worker_id}: {message}")]
    Spawn { worker_id: String, message: String },

    #[error("Worker {worker_id} did not complete its handshake within {timeout:?}")]
    HandshakeTimeout { worker_id: String, timeout: Duration },

    #[error("Handshake with worker {worker_id} failed: {message}")]
    Handshake { worker_id: String, message: String },

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid listen URI: {0}")]
    InvalidUri(String),

    #[error("Socket import failed: {0}")]
    SocketImport(String),

    #[error("Socket sharing is disabled for this worker")]
    SocketSharingDisabled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClusterError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

/// Fatal errors while bootstrapping a worker process
///
/// Each maps to a process exit code; nothing is cleaned up beyond closing
/// the control channel.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid worker arguments: {0}")]
    Usage(String),

    #[error("Unknown worker entry: {0}")]
    UnknownEntry(String),

    #[error("Worker context already created in this process")]
    AlreadyBootstrapped,

    #[error("Controller handshake failed: {0}")]
    Handshake(#[from] IpcError),
}

impl BootstrapError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::UnknownEntry(_) | Self::AlreadyBootstrapped => EXIT_USAGE,
            Self::Handshake(_) => EXIT_IPC_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_exit_codes() {
        assert_eq!(BootstrapError::Usage("missing entry".into()).exit_code(), 64);
        assert_eq!(BootstrapError::UnknownEntry("nope".into()).exit_code(), 64);
        assert_eq!(BootstrapError::Handshake(IpcError::Timeout).exit_code(), 70);
    }

    #[test]
    fn test_usage_classification() {
        assert!(ClusterError::usage("start called twice").is_usage());
        assert!(!ClusterError::SocketSharingDisabled.is_usage());
        assert!(ClusterError::from(IpcError::ConnectionClosed)
            .to_string()
            .contains("Connection closed"));
    }
}
