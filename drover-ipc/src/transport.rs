//! Control-channel transports
//!
//! Messages travel as newline-delimited JSON envelopes. The controller talks
//! to a worker over the child's stdin/stdout; the worker uses its own stdio.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Boxed read half of a control channel
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a control channel
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads envelopes from a byte stream
pub struct LineReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Receive the next envelope
    ///
    /// Returns `IpcError::ConnectionClosed` once the peer closed its end.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

            // Check protocol version compatibility
            if !envelope.is_compatible() {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(envelope);
        }
    }
}

/// Writes envelopes to a byte stream
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send one envelope and flush
    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write side down so the peer observes end of stream
    pub async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Bidirectional control channel between controller and one worker
pub struct ControlChannel {
    pub reader: LineReader<BoxedRead>,
    pub writer: LineWriter<BoxedWrite>,
}

impl ControlChannel {
    /// Build a channel from arbitrary read/write halves
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: LineReader::new(Box::new(reader)),
            writer: LineWriter::new(Box::new(writer)),
        }
    }

    /// Controller side: talk to a child over its stdin/stdout
    pub fn from_child(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Worker side: talk to the controller over our own stdio
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn into_parts(self) -> (LineReader<BoxedRead>, LineWriter<BoxedWrite>) {
        (self.reader, self.writer)
    }
}
