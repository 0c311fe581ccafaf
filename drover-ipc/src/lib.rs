//! Inter-process communication for drover
//!
//! This crate provides the control-channel protocol spoken between the
//! controller and its workers, the newline-delimited JSON transports that
//! carry it, and the authenticated Unix-domain channel used to hand bound
//! socket descriptors to workers.

pub mod error;
pub mod protocol;
pub mod transfer;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{ControllerMessage, MessageEnvelope, WorkerMessage, IPC_PROTOCOL_VERSION};
pub use transfer::{
    connect_authenticated, rendezvous_path, rendezvous_uri, HandshakeKey, RendezvousListener,
    SocketTransferChannel, HANDSHAKE_KEY_LEN, NO_RENDEZVOUS,
};
pub use transport::{BoxedRead, BoxedWrite, ControlChannel, LineReader, LineWriter};
