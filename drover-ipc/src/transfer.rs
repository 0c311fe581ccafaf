//! Socket descriptor transfer between controller and worker
//!
//! A worker opens a secondary Unix-domain connection to the controller's
//! rendezvous socket and proves, by writing the [`HandshakeKey`] it received
//! over the control channel, that it is the process the controller spawned.
//! The authenticated connection then carries bound socket descriptors as
//! `SCM_RIGHTS` ancillary data.

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::stream::{FuturesUnordered, StreamExt};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::IpcError;

/// Length of the handshake key in bytes
pub const HANDSHAKE_KEY_LEN: usize = 32;

/// Rendezvous URI that disables the transfer handshake
pub const NO_RENDEZVOUS: &str = "-";

/// How long an accepted connection may take to present its key
const KEY_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// One-time random token proving a transfer connection came from our worker
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeKey([u8; HANDSHAKE_KEY_LEN]);

impl HandshakeKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; HANDSHAKE_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HANDSHAKE_KEY_LEN] {
        &self.0
    }

    /// Constant-time comparison against presented bytes
    pub fn matches(&self, presented: &[u8]) -> bool {
        if presented.len() != HANDSHAKE_KEY_LEN {
            return false;
        }
        self.0
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for HandshakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandshakeKey(..)")
    }
}

impl Serialize for HandshakeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for HandshakeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let key: [u8; HANDSHAKE_KEY_LEN] = bytes.try_into().map_err(|_| {
            serde::de::Error::custom(format!("handshake key must be {} bytes", HANDSHAKE_KEY_LEN))
        })?;
        Ok(Self(key))
    }
}

/// Format a rendezvous URI for a socket path
pub fn rendezvous_uri(path: &Path) -> String {
    format!("unix://{}", path.display())
}

/// Extract the socket path from a `unix://` rendezvous URI
pub fn rendezvous_path(uri: &str) -> Result<PathBuf, IpcError> {
    let path = uri
        .strip_prefix("unix://")
        .ok_or_else(|| IpcError::InvalidRendezvous(uri.to_string()))?;
    if !path.starts_with('/') {
        return Err(IpcError::InvalidRendezvous(uri.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Controller-side listener workers connect to for their transfer connection
pub struct RendezvousListener {
    listener: UnixListener,
    path: PathBuf,
}

impl RendezvousListener {
    /// Bind the rendezvous socket, replacing a stale socket file
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        debug!("Rendezvous listener bound at {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn uri(&self) -> String {
        rendezvous_uri(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until one presents `key`
    ///
    /// Keys are read concurrently, so idle or slow connections cannot hold
    /// up the real worker. Connections with a wrong or missing key are
    /// dropped without a response. The caller bounds the overall wait.
    pub async fn accept_authenticated(
        &self,
        key: &HandshakeKey,
    ) -> Result<SocketTransferChannel, IpcError> {
        let mut presenting = FuturesUnordered::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    presenting.push(read_presented_key(stream));
                }
                Some(presented) = presenting.next(), if !presenting.is_empty() => match presented {
                    Ok((stream, presented)) if key.matches(&presented) => {
                        return Ok(SocketTransferChannel::new(stream));
                    }
                    Ok(_) => warn!("Rejected transfer connection: {}", IpcError::KeyMismatch),
                    Err(e) => debug!("Transfer connection did not present a key: {}", e),
                },
            }
        }
    }
}

async fn read_presented_key(
    mut stream: UnixStream,
) -> io::Result<(UnixStream, [u8; HANDSHAKE_KEY_LEN])> {
    let mut presented = [0u8; HANDSHAKE_KEY_LEN];
    tokio::time::timeout(KEY_READ_TIMEOUT, stream.read_exact(&mut presented))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out"))??;
    Ok((stream, presented))
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Worker side: connect to the rendezvous socket and authenticate
pub async fn connect_authenticated(
    uri: &str,
    key: &HandshakeKey,
    timeout: Duration,
) -> Result<SocketTransferChannel, IpcError> {
    let path = rendezvous_path(uri)?;

    let handshake = async {
        let mut stream = UnixStream::connect(&path).await?;
        stream.write_all(key.as_bytes()).await?;
        stream.flush().await?;
        Ok::<_, IpcError>(stream)
    };

    let stream = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| IpcError::Timeout)??;
    Ok(SocketTransferChannel::new(stream))
}

/// Authenticated connection carrying socket descriptors
///
/// Each transfer is one 8-byte tag (little endian) with exactly one
/// descriptor attached.
#[derive(Debug)]
pub struct SocketTransferChannel {
    stream: UnixStream,
}

impl SocketTransferChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Send a descriptor labelled with `tag`
    pub async fn send(&self, fd: BorrowedFd<'_>, tag: u64) -> Result<(), IpcError> {
        let payload = tag.to_le_bytes();
        let fds = [fd.as_raw_fd()];
        let socket = self.stream.as_raw_fd();

        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&payload)];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(socket, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
            })
            .await?;

        if sent != payload.len() {
            return Err(IpcError::TransferFailed(format!(
                "short write: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(())
    }

    /// Receive the next descriptor and its tag
    pub async fn receive(&self) -> Result<(OwnedFd, u64), IpcError> {
        let socket = self.stream.as_raw_fd();

        let (fds, payload, read) = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut payload = [0u8; 8];
                let mut fds: Vec<RawFd> = Vec::new();
                let read = {
                    let mut iov = [IoSliceMut::new(&mut payload)];
                    let mut space = nix::cmsg_space!([RawFd; 1]);
                    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut space), receive_flags())
                        .map_err(io::Error::from)?;
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            fds.extend(received);
                        }
                    }
                    msg.bytes
                };
                Ok((fds, payload, read))
            })
            .await?;

        // Take ownership first so every received descriptor gets closed
        // on the error paths below.
        let mut owned: Vec<OwnedFd> = fds
            .into_iter()
            // SAFETY: SCM_RIGHTS installed these descriptors in this process
            // and nothing else holds them.
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if read == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        if read != payload.len() {
            return Err(IpcError::TransferFailed(format!(
                "short read: {} of {} bytes",
                read,
                payload.len()
            )));
        }
        if owned.len() != 1 {
            return Err(IpcError::TransferFailed(format!(
                "expected one descriptor, received {}",
                owned.len()
            )));
        }

        let fd = owned.remove(0);
        Ok((fd, u64::from_le_bytes(payload)))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn receive_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn receive_flags() -> MsgFlags {
    MsgFlags::empty()
}
