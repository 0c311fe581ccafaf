//! Message bus over a control channel
//!
//! Both sides use the same two halves: an [`Outbound`] queue drained by a
//! writer task, and [`run_inbound`] dispatching received messages to a
//! handler. There are no acknowledgements and no retries; a broken control
//! channel means the peer is gone.

use std::ops::ControlFlow;

use async_trait::async_trait;
use drover_ipc::{BoxedRead, BoxedWrite, ControllerMessage, IpcError, LineReader, LineWriter, MessageEnvelope};
use drover_logging::{LogRecord, RecordSink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Frame<T> {
    Message(T),
    Close(oneshot::Sender<()>),
}

/// Clonable sender feeding one control channel's writer task
pub struct Outbound<T> {
    tx: mpsc::UnboundedSender<Frame<T>>,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

// Sync: the writer task holds `&MessageEnvelope<T>` across an await
impl<T: Serialize + Send + Sync + 'static> Outbound<T> {
    /// Spawn the writer task for `writer`
    ///
    /// The task must not emit per-message tracing events: inside a worker
    /// those events are themselves forwarded through this queue.
    pub fn spawn(peer: impl Into<String>, mut writer: LineWriter<BoxedWrite>) -> (Self, JoinHandle<()>) {
        let peer = peer.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame<T>>();

        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Frame::Message(message) => {
                        if let Err(e) = writer.send(&MessageEnvelope::new(message)).await {
                            // A closed pipe is the normal way a peer goes away
                            if matches!(e, IpcError::ConnectionClosed) {
                                debug!("Control channel to {} closed", peer);
                            } else {
                                warn!("Failed to write to {}: {}", peer, e);
                            }
                            break;
                        }
                    }
                    Frame::Close(done) => {
                        let _ = writer.close().await;
                        let _ = done.send(());
                        break;
                    }
                }
            }
        });

        (Self { tx }, task)
    }

    /// Enqueue a message; fails only once the writer task is gone
    pub fn send(&self, message: T) -> Result<(), IpcError> {
        self.tx
            .send(Frame::Message(message))
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Flush everything queued so far, then shut the write side down
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Frame::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker-side log forwarding: records become `log` messages
impl RecordSink for Outbound<ControllerMessage> {
    fn forward(&self, record: LogRecord) {
        let _ = self.send(ControllerMessage::Log { record });
    }
}

/// Receives messages read from a control channel
#[async_trait]
pub trait Inbound<T>: Send {
    /// Handle one message; `Break` ends the receive loop
    async fn on_message(&mut self, message: T) -> ControlFlow<()>;
}

/// Why a receive loop ended
#[derive(Debug)]
pub enum LoopExit {
    /// The handler asked to stop
    Completed,
    /// The peer closed the channel
    Closed,
    Failed(IpcError),
}

/// Read messages until the handler breaks or the channel ends
///
/// Lines that do not parse are skipped; a worker writing stray output to
/// stdout must not take its control channel down.
pub async fn run_inbound<T, H>(reader: &mut LineReader<BoxedRead>, handler: &mut H) -> LoopExit
where
    T: DeserializeOwned + Send,
    H: Inbound<T>,
{
    loop {
        match reader.receive::<T>().await {
            Ok(envelope) => {
                if handler.on_message(envelope.message).await.is_break() {
                    return LoopExit::Completed;
                }
            }
            Err(IpcError::ConnectionClosed) => return LoopExit::Closed,
            Err(IpcError::DeserializationError(e)) => {
                warn!("Skipping unreadable control message: {}", e);
            }
            Err(e) => return LoopExit::Failed(e),
        }
    }
}
