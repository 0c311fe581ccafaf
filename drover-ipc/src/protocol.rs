//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use drover_logging::LogRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::transfer::HandshakeKey;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the controller to worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Where to open the transfer connection and the key proving who we are
    Handshake {
        rendezvous_uri: String,
        key: HandshakeKey,
    },

    /// Application payload broadcast or unicast by the controller
    Data { payload: JsonValue },

    /// The requested socket descriptor was written to the transfer connection
    SocketReady { request_id: u64 },

    /// The requested socket could not be bound
    SocketError { request_id: u64, error: String },

    /// Run termination hooks and exit
    Terminate,
}

/// Messages sent from worker processes to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Application payload for the aggregation stream
    Data { payload: JsonValue },

    /// Structured log record for the controller's log sink
    Log { record: LogRecord },

    /// Request a bound listening socket for `uri`
    ImportSocket { request_id: u64, uri: String },

    /// Termination hooks have run; the worker is about to exit
    Terminated,
}

impl WorkerMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Handshake { .. } => "handshake",
            WorkerMessage::Data { .. } => "data",
            WorkerMessage::SocketReady { .. } => "socket_ready",
            WorkerMessage::SocketError { .. } => "socket_error",
            WorkerMessage::Terminate => "terminate",
        }
    }
}

impl ControllerMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::Data { .. } => "data",
            ControllerMessage::Log { .. } => "log",
            ControllerMessage::ImportSocket { .. } => "import_socket",
            ControllerMessage::Terminated => "terminated",
        }
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
