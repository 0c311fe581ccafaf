//! Controller side of one worker
//!
//! A session owns the worker's process handle and control channel, runs the
//! controller half of the transfer handshake, and then reads the channel
//! until the worker reports `terminated` or goes away.

use std::ops::ControlFlow;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_ipc::{
    ControllerMessage, HandshakeKey, RendezvousListener, SocketTransferChannel, WorkerMessage,
    NO_RENDEZVOUS,
};
use drover_logging::emit_forwarded;
use nix::sys::signal::Signal;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{run_inbound, Inbound, LoopExit, Outbound};
use crate::error::{ClusterError, ClusterResult};
use crate::process::{Process, ProcessSpawner, SpawnRequest, SpawnedWorker};
use crate::registry::{ListenUri, SocketRegistry};

/// Lifecycle of a worker as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Exited,
}

/// Snapshot returned by `Supervisor::workers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
}

/// One `data` message received from a worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub worker_id: String,
    pub payload: JsonValue,
}

/// How a worker left during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Clean,
    Killed,
}

/// Collaborators shared by every session of one cluster
#[derive(Clone)]
pub(crate) struct SessionShared {
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub registry: Arc<SocketRegistry>,
    pub connect_timeout: Duration,
}

pub struct WorkerSession {
    id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    process: Box<dyn Process>,
    outbound: Outbound<WorkerMessage>,
    writer_task: JoinHandle<()>,
    run_task: JoinHandle<()>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerSession {
    /// Spawn a worker and complete its handshake
    ///
    /// On failure the process is killed before the error is returned.
    pub(crate) async fn establish(
        worker_id: String,
        spawner: &dyn ProcessSpawner,
        rendezvous: Option<&RendezvousListener>,
        shared: &SessionShared,
    ) -> ClusterResult<Self> {
        let rendezvous_uri = rendezvous
            .map(|listener| listener.uri())
            .unwrap_or_else(|| NO_RENDEZVOUS.to_string());

        let SpawnedWorker {
            mut process,
            control,
        } = spawner.spawn(&SpawnRequest {
            worker_id: worker_id.clone(),
            rendezvous_uri: rendezvous_uri.clone(),
        })?;
        let pid = process.id();
        debug!("Spawned worker {} (pid {:?})", worker_id, pid);

        let (mut reader, writer) = control.into_parts();
        let (outbound, writer_task) = Outbound::spawn(worker_id.clone(), writer);

        let transfer = match rendezvous {
            Some(listener) => {
                let exchange = handshake(
                    &worker_id,
                    &outbound,
                    listener,
                    rendezvous_uri,
                    shared.connect_timeout,
                    process.as_mut(),
                );
                match exchange.await {
                    Ok(channel) => Some(channel),
                    Err(e) => {
                        if process.is_running() {
                            if let Err(kill_err) = process.kill().await {
                                warn!("Failed to kill worker {}: {}", worker_id, kill_err);
                            }
                        }
                        writer_task.abort();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let (state_tx, state_rx) = watch::channel(WorkerState::Running);
        let mut inbound = SessionInbound {
            worker_id: worker_id.clone(),
            events: shared.events.clone(),
            registry: shared.registry.clone(),
            transfer,
            outbound: outbound.clone(),
        };

        let run_id = worker_id.clone();
        let run_task = tokio::spawn(async move {
            match run_inbound::<ControllerMessage, _>(&mut reader, &mut inbound).await {
                LoopExit::Completed => debug!("Worker {} terminated", run_id),
                LoopExit::Closed => warn!("Worker {} exited abruptly", run_id),
                LoopExit::Failed(e) => error!("Control channel to worker {} failed: {}", run_id, e),
            }
            let _ = state_tx.send(WorkerState::Exited);
        });

        Ok(Self {
            id: worker_id,
            pid,
            started_at: Utc::now(),
            process,
            outbound,
            writer_task,
            run_task,
            state: state_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            pid: self.pid,
            state: self.state(),
            started_at: self.started_at,
        }
    }

    /// Enqueue a `data` message
    pub fn send(&self, payload: JsonValue) -> ClusterResult<()> {
        self.outbound.send(WorkerMessage::Data { payload })?;
        Ok(())
    }

    /// Ask the worker to run its termination hooks and exit
    ///
    /// Falls back to SIGTERM when the control channel is already gone.
    pub fn terminate(&self) {
        if self.outbound.send(WorkerMessage::Terminate).is_err() {
            if let Err(e) = self.process.signal(Signal::SIGTERM) {
                debug!("Failed to signal worker {}: {}", self.id, e);
            }
        }
    }

    /// Terminate, wait up to `grace` for the worker to exit, then kill it
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        self.terminate();

        let mut state = self.state.clone();
        let process = &mut self.process;
        let exited = tokio::time::timeout(grace, async {
            let _ = state.wait_for(|s| *s == WorkerState::Exited).await;
            process.wait().await
        })
        .await;

        match exited {
            Ok(Ok(code)) => {
                debug!("Worker {} exited with code {:?}", self.id, code);
                ShutdownOutcome::Clean
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for worker {}: {}", self.id, e);
                self.force_kill().await;
                ShutdownOutcome::Killed
            }
            Err(_) => {
                warn!(
                    "Worker {} did not exit within {:?}, killing it",
                    self.id, grace
                );
                self.force_kill().await;
                ShutdownOutcome::Killed
            }
        }
    }

    async fn force_kill(&mut self) {
        if let Err(e) = self.process.kill().await {
            error!("Failed to kill worker {}: {}", self.id, e);
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.run_task.abort();
        self.writer_task.abort();
    }
}

/// Controller half of the transfer handshake
///
/// Fails as soon as the worker exits instead of waiting out `timeout`.
async fn handshake(
    worker_id: &str,
    outbound: &Outbound<WorkerMessage>,
    listener: &RendezvousListener,
    rendezvous_uri: String,
    timeout: Duration,
    process: &mut dyn Process,
) -> ClusterResult<SocketTransferChannel> {
    let key = HandshakeKey::generate();
    outbound
        .send(WorkerMessage::Handshake {
            rendezvous_uri,
            key: key.clone(),
        })
        .map_err(|e| ClusterError::Handshake {
            worker_id: worker_id.to_string(),
            message: e.to_string(),
        })?;

    let accepted = tokio::select! {
        accepted = tokio::time::timeout(timeout, listener.accept_authenticated(&key)) => accepted,
        exited = process.wait() => {
            let message = match exited {
                Ok(Some(code)) => format!("worker exited with code {} during the handshake", code),
                Ok(None) => "worker was killed by a signal during the handshake".to_string(),
                Err(e) => format!("failed to wait for worker: {}", e),
            };
            return Err(ClusterError::Handshake {
                worker_id: worker_id.to_string(),
                message,
            });
        }
    };

    match accepted {
        Ok(Ok(channel)) => {
            debug!("Worker {} completed its handshake", worker_id);
            Ok(channel)
        }
        Ok(Err(e)) => Err(ClusterError::Handshake {
            worker_id: worker_id.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(ClusterError::HandshakeTimeout {
            worker_id: worker_id.to_string(),
            timeout,
        }),
    }
}

struct SessionInbound {
    worker_id: String,
    events: mpsc::UnboundedSender<WorkerEvent>,
    registry: Arc<SocketRegistry>,
    transfer: Option<SocketTransferChannel>,
    outbound: Outbound<WorkerMessage>,
}

impl SessionInbound {
    async fn serve_import(&self, request_id: u64, uri: &str) {
        let reply = match self.transfer_socket(request_id, uri).await {
            Ok(()) => {
                info!("Shared {} with worker {}", uri, self.worker_id);
                WorkerMessage::SocketReady { request_id }
            }
            Err(e) => {
                warn!("Worker {} could not import {}: {}", self.worker_id, uri, e);
                WorkerMessage::SocketError {
                    request_id,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.outbound.send(reply);
    }

    async fn transfer_socket(&self, request_id: u64, uri: &str) -> ClusterResult<()> {
        let transfer = self
            .transfer
            .as_ref()
            .ok_or(ClusterError::SocketSharingDisabled)?;
        let uri: ListenUri = uri.parse()?;
        let socket = self.registry.bind(&uri)?;
        transfer.send(socket.as_fd(), request_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Inbound<ControllerMessage> for SessionInbound {
    async fn on_message(&mut self, message: ControllerMessage) -> ControlFlow<()> {
        match message {
            ControllerMessage::Data { payload } => {
                // Nobody iterating any more is not the worker's problem
                let _ = self.events.send(WorkerEvent {
                    worker_id: self.worker_id.clone(),
                    payload,
                });
            }
            ControllerMessage::Log { record } => emit_forwarded(&self.worker_id, &record),
            ControllerMessage::ImportSocket { request_id, uri } => {
                self.serve_import(request_id, &uri).await
            }
            ControllerMessage::Terminated => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}
