//! Drover cluster runtime
//!
//! The controller side spawns worker processes through a [`Supervisor`],
//! shares bound listening sockets with them, and aggregates the data they
//! send. The worker side bootstraps a [`WorkerContext`] from its spawn
//! arguments and control channel.

pub mod bus;
pub mod client;
pub mod error;
pub mod process;
pub mod registry;
pub mod session;
pub mod supervisor;

#[cfg(test)]
mod testing;

// Re-export main types
pub use client::{LogForwarder, MessageHandler, TerminateHandler, WorkerBootstrap, WorkerContext};
pub use error::{BootstrapError, ClusterError, ClusterResult, EXIT_IPC_FAILURE, EXIT_USAGE};
pub use process::{
    ChildProcess, CommandSpawner, Process, ProcessSpawner, SpawnRequest, SpawnedWorker,
    WORKER_ID_ENV, WORKER_SUBCOMMAND,
};
pub use registry::{BoundSocket, Connection, ListenUri, Listener, SocketRegistry, DEFAULT_BACKLOG};
pub use session::{ShutdownOutcome, WorkerEvent, WorkerInfo, WorkerState};
pub use supervisor::{MessageStream, ShutdownReport, Supervisor};
