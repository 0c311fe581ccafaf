//! Listening-socket registry
//!
//! The controller binds each listen URI once and hands duplicates of the
//! bound descriptor to workers. `listen()` is never called here; each
//! consumer calls [`BoundSocket::listen`] with its own backlog.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixSocket, UnixStream};
use tracing::debug;
use url::{Host, Url};

use crate::error::ClusterError;

/// Backlog used when a consumer has no preference
pub const DEFAULT_BACKLOG: u32 = 1024;

/// A parsed listen address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenUri {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenUri {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ClusterError::InvalidUri(format!("{}: {}", s, reason));
        let url = Url::parse(s).map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "tcp" => {
                // `tcp` is not a special scheme, so Url leaves IPv4 hosts opaque
                let ip = match url.host() {
                    Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
                    Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
                    Some(Host::Domain("localhost")) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    Some(Host::Domain(host)) => host
                        .parse::<Ipv4Addr>()
                        .map(IpAddr::V4)
                        .map_err(|_| invalid("host must be an IP literal or localhost"))?,
                    None => return Err(invalid("missing host")),
                };
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(ListenUri::Tcp(SocketAddr::new(ip, port)))
            }
            "unix" => {
                // The path is taken verbatim; Url would treat the first
                // segment of `unix://relative.sock` as a host.
                let path = s
                    .strip_prefix("unix://")
                    .filter(|path| path.starts_with('/'))
                    .ok_or_else(|| invalid("path must be absolute (unix:///path)"))?;
                Ok(ListenUri::Unix(PathBuf::from(path)))
            }
            other => Err(invalid(&format!("unsupported scheme '{}'", other))),
        }
    }
}

impl fmt::Display for ListenUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenUri::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenUri::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A socket that is bound but not yet listening
#[derive(Debug)]
pub struct BoundSocket {
    uri: ListenUri,
    fd: OwnedFd,
}

impl BoundSocket {
    /// Bind a fresh socket for `uri`
    pub fn bind(uri: &ListenUri) -> io::Result<Self> {
        let fd = match uri {
            ListenUri::Tcp(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(*addr)?;
                // SAFETY: into_raw_fd hands over sole ownership of the descriptor.
                unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) }
            }
            ListenUri::Unix(path) => {
                remove_stale_socket(path)?;
                let socket = UnixSocket::new_stream()?;
                socket.bind(path)?;
                // SAFETY: into_raw_fd hands over sole ownership of the descriptor.
                unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) }
            }
        };

        debug!("Bound {}", uri);
        Ok(Self {
            uri: uri.clone(),
            fd,
        })
    }

    /// Wrap a descriptor received from the controller
    pub fn from_fd(uri: ListenUri, fd: OwnedFd) -> Self {
        Self { uri, fd }
    }

    pub fn uri(&self) -> &ListenUri {
        &self.uri
    }

    /// Duplicate the descriptor; both handles refer to the same socket
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            uri: self.uri.clone(),
            fd: self.fd.try_clone()?,
        })
    }

    /// Start listening with a consumer-chosen backlog
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(self, backlog: u32) -> io::Result<Listener> {
        set_nonblocking(&self.fd)?;
        let raw = self.fd.into_raw_fd();

        match self.uri {
            ListenUri::Tcp(_) => {
                // SAFETY: `raw` is an owned, bound TCP socket descriptor.
                let socket = unsafe { TcpSocket::from_raw_fd(raw) };
                Ok(Listener::Tcp(socket.listen(backlog)?))
            }
            ListenUri::Unix(_) => {
                // SAFETY: `raw` is an owned, bound Unix stream socket descriptor.
                let socket = unsafe { UnixSocket::from_raw_fd(raw) };
                Ok(Listener::Unix(socket.listen(backlog)?))
            }
        }
    }
}

impl AsFd for BoundSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A listening socket owned by one consumer
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => Ok(Connection::Tcp(listener.accept().await?.0)),
            Listener::Unix(listener) => Ok(Connection::Unix(listener.accept().await?.0)),
        }
    }

    /// The address actually bound (resolves port 0)
    pub fn local_addr(&self) -> io::Result<ListenUri> {
        match self {
            Listener::Tcp(listener) => Ok(ListenUri::Tcp(listener.local_addr()?)),
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "unix listener has no path")
                })?;
                Ok(ListenUri::Unix(path.to_path_buf()))
            }
        }
    }
}

/// An accepted connection
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Bind-once cache of listening sockets keyed by URI
#[derive(Debug, Default)]
pub struct SocketRegistry {
    sockets: Mutex<HashMap<ListenUri, BoundSocket>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a handle to the socket bound for `uri`, binding it on first use
    pub fn bind(&self, uri: &ListenUri) -> io::Result<BoundSocket> {
        let mut sockets = self.sockets.lock();

        if let Some(socket) = sockets.get(uri) {
            return socket.try_clone();
        }

        let socket = BoundSocket::bind(uri)?;
        let handle = socket.try_clone()?;
        sockets.insert(uri.clone(), socket);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
