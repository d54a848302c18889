use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
#[cfg(target_os = "linux")]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{
        bind, listen, setsockopt, socket, sockopt::ReuseAddr, AddressFamily, Backlog, SockFlag,
        SockType, SockaddrStorage,
    },
};

/// A connected stream socket, local-domain or TCP.
pub enum PlatformSocket {
    /// Local-domain socket; the kernel vouches for the peer
    Unix(UnixStream),
    /// TCP connection
    Tcp(TcpStream),
}

/// A listening socket.
pub enum PlatformListener {
    /// Local-domain listener, path removed again on drop
    Unix {
        listener: UnixListener,
        path:     PathBuf,
    },
    /// TCP listener
    Tcp(TcpListener),
}

/// Peer process identity taken from a local-domain socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer
    pub uid: u32,
    /// Group ID of the peer
    pub gid: u32,
}

impl PlatformSocket {
    /// Set the socket to blocking or non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            PlatformSocket::Unix(stream) => stream.set_nonblocking(nonblocking),
            PlatformSocket::Tcp(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// True when the peer identity is established by the kernel.
    pub fn is_local_domain(&self) -> bool {
        matches!(self, PlatformSocket::Unix(_))
    }

    /// True for TCP connections from a loopback address.
    pub fn is_loopback(&self) -> bool {
        match self {
            PlatformSocket::Unix(_) => false,
            PlatformSocket::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.ip().is_loopback())
                .unwrap_or(false),
        }
    }

    /// Human readable peer address for logging.
    pub fn peer_description(&self) -> String {
        match self {
            PlatformSocket::Unix(stream) => match stream.peer_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("local:{}", path.display()),
                    None => "local:(unnamed)".to_string(),
                },
                Err(_) => "local:(unknown)".to_string(),
            },
            PlatformSocket::Tcp(stream) => match stream.peer_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "(unknown)".to_string(),
            },
        }
    }

    /// Extract peer credentials from a local-domain connection
    pub fn get_peer_credentials(&self) -> Result<ClientCredentials> {
        match self {
            PlatformSocket::Unix(stream) => {
                #[cfg(target_os = "linux")]
                {
                    let creds = getsockopt(stream, PeerCredentials)
                        .context("Failed to get peer credentials")?;

                    Ok(ClientCredentials {
                        pid: creds.pid() as u32,
                        uid: creds.uid(),
                        gid: creds.gid(),
                    })
                }

                #[cfg(not(target_os = "linux"))]
                {
                    let mut uid: libc::uid_t = 0;
                    let mut gid: libc::gid_t = 0;

                    // SAFETY: getpeereid is safe to call with a valid file descriptor and
                    // mutable references to uid_t and gid_t. stream.as_raw_fd() returns a
                    // valid fd and uid/gid are initialized stack variables.
                    let result =
                        unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };

                    if result != 0 {
                        return Err(anyhow!(
                            "Failed to get peer credentials: {}",
                            io::Error::last_os_error()
                        ));
                    }

                    Ok(ClientCredentials { pid: 0, uid, gid })
                }
            }
            PlatformSocket::Tcp(_) => Err(anyhow!("Peer credentials require a local-domain socket")),
        }
    }
}

impl AsFd for PlatformSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            PlatformSocket::Unix(stream) => stream.as_fd(),
            PlatformSocket::Tcp(stream) => stream.as_fd(),
        }
    }
}

impl AsRawFd for PlatformSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl Read for PlatformSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PlatformSocket::Unix(stream) => stream.read(buf),
            PlatformSocket::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for PlatformSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PlatformSocket::Unix(stream) => stream.write(buf),
            PlatformSocket::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PlatformSocket::Unix(stream) => stream.flush(),
            PlatformSocket::Tcp(stream) => stream.flush(),
        }
    }
}

impl PlatformListener {
    /// Create a local-domain listener at `path`, replacing a stale socket
    /// file left behind by an earlier run.
    pub fn bind_unix(path: &Path) -> Result<Self> {
        tracing::info!("Setting up local socket listener: {}", path.display());

        if path.exists() {
            tracing::warn!("Existing socket file found, removing it...");
            std::fs::remove_file(path).map_err(|e| {
                tracing::error!("Failed to remove old socket file: {}", e);
                anyhow!(
                    "Could not remove existing socket file '{}': {}. You may need to stop the \
                     existing relay or remove the file manually.",
                    path.display(),
                    e
                )
            })?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(anyhow!(
                    "Parent path '{}' does not exist or is not a directory",
                    parent.display()
                ));
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());
            let detail = match e.kind() {
                io::ErrorKind::PermissionDenied => format!(
                    "Permission denied creating socket '{}'. Check parent directory permissions.",
                    path.display()
                ),
                io::ErrorKind::InvalidInput => format!(
                    "Invalid socket path '{}'. Check that the path is valid and not too long.",
                    path.display()
                ),
                _ => format!("Unexpected error binding to socket '{}': {}", path.display(), e),
            };
            anyhow!("{}\n\nOS Error Code: {}", detail, e.raw_os_error().unwrap_or(-1))
        })?;

        tracing::info!("✓ Bound local socket {}", path.display());
        Ok(PlatformListener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Create a TCP listener with an explicit pending-connection backlog.
    pub fn bind_tcp(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
            .with_context(|| format!("Failed to create socket for {addr}"))?;
        setsockopt(&fd, ReuseAddr, &true)
            .with_context(|| format!("Failed to set SO_REUSEADDR on {addr}"))?;
        bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))
            .with_context(|| format!("Failed to bind {addr}"))?;
        let backlog = Backlog::new(backlog.max(1))
            .with_context(|| format!("Invalid listen backlog {backlog}"))?;
        listen(&fd, backlog).with_context(|| format!("Failed to listen on {addr}"))?;

        tracing::info!("✓ Listening on {}", addr);
        Ok(PlatformListener::Tcp(TcpListener::from(fd)))
    }

    /// Accept one connection. The returned socket is in blocking mode.
    pub fn accept(&self) -> io::Result<PlatformSocket> {
        let socket = match self {
            PlatformListener::Unix { listener, .. } => PlatformSocket::Unix(listener.accept()?.0),
            PlatformListener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                PlatformSocket::Tcp(stream)
            }
        };
        socket.set_nonblocking(false)?;
        Ok(socket)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            PlatformListener::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
            PlatformListener::Tcp(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Address for logging.
    pub fn describe(&self) -> String {
        match self {
            PlatformListener::Unix { path, .. } => format!("local:{}", path.display()),
            PlatformListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "(unbound)".to_string(),
            },
        }
    }

    /// Bound TCP address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            PlatformListener::Unix { .. } => None,
            PlatformListener::Tcp(listener) => listener.local_addr().ok(),
        }
    }
}

impl AsFd for PlatformListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            PlatformListener::Unix { listener, .. } => listener.as_fd(),
            PlatformListener::Tcp(listener) => listener.as_fd(),
        }
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        if let PlatformListener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                tracing::debug!("Could not remove socket file {}: {}", path.display(), e);
            }
        }
    }
}

/// Connect to a local-domain socket.
pub fn connect_unix(path: &Path) -> io::Result<PlatformSocket> {
    UnixStream::connect(path).map(PlatformSocket::Unix)
}

/// Connect to `host:port`, trying each resolved address in turn. `None`
/// waits as long as the OS does.
pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<PlatformSocket> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(PlatformSocket::Tcp(stream));
            }
            Err(e) => {
                tracing::debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
    }))
}

/// Wait until any of `fds` is readable. Returns one flag per descriptor;
/// hangups and errors count as readable so the caller sees them on read.
/// `None` blocks indefinitely. An interrupted wait returns no ready
/// descriptors.
pub fn poll_readable<F: AsFd>(fds: &[F], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
        .collect();

    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(left) => {
            // round up so a sub-millisecond remainder still waits
            let millis = left.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    };

    match poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e.into()),
    }

    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().is_some_and(|revents| revents.intersects(ready)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_domain_peer_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.sock");
        let listener = PlatformListener::bind_unix(&path).unwrap();
        let client = connect_unix(&path).unwrap();
        let server = listener.accept().unwrap();

        assert!(server.is_local_domain());
        assert!(!server.is_loopback());
        let creds = server.get_peer_credentials().unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        drop(client);
    }

    #[test]
    fn stale_socket_file_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();
        let listener = PlatformListener::bind_unix(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn tcp_loopback_and_readiness() {
        let listener =
            PlatformListener::bind_tcp("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = connect_tcp("127.0.0.1", addr.port(), Some(Duration::from_secs(2))).unwrap();
        let server = listener.accept().unwrap();
        assert!(server.is_loopback());
        assert!(server.get_peer_credentials().is_err());

        let idle = poll_readable(&[&server], Some(Duration::from_millis(10))).unwrap();
        assert_eq!(idle, vec![false]);

        client.write_all(b"x").unwrap();
        let ready = poll_readable(&[&server], Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready, vec![true]);
    }

    #[test]
    fn refused_connection_is_an_error() {
        let listener =
            PlatformListener::bind_tcp("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(connect_tcp("127.0.0.1", port, Some(Duration::from_millis(500))).is_err());
    }
}
