//! Listening sockets that let external peers talk to stream-protocol workers.
//!
//! The master binds the socket before forking, so every worker inherits it
//! and competes in `accept`. Each accepted connection carries one request
//! frame; the worker answers on the same connection and closes it.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, UnixAddr, bind, listen,
    setsockopt, socket, sockopt,
};

use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, StreamCodec, TaskMessage, encode_stream_frame};

/// How long a worker waits for a connected peer to finish its request.
const PEER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a pool listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// A Unix domain socket file.
    Unix(PathBuf),
    /// A TCP address.
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = Error;

    /// `unix:/path`, anything containing a `/`, or `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if s.contains('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(s)));
        }
        s.to_socket_addrs()
            .map_err(|e| Error::Config(format!("invalid listen address {:?}: {}", s, e)))?
            .next()
            .map(ListenAddr::Tcp)
            .ok_or_else(|| Error::Config(format!("listen address {:?} resolves to nothing", s)))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

enum Socket {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A bound, non-blocking listening socket shared by every worker.
pub struct Listener {
    socket: Socket,
    addr: ListenAddr,
    max_frame_size: usize,
    owner: nix::unistd::Pid,
}

impl Listener {
    /// Bind `addr` with the given accept backlog. A stale Unix socket file
    /// at the same path is replaced.
    pub fn bind(addr: &ListenAddr, backlog: i32, max_frame_size: usize) -> Result<Self> {
        // Out-of-range backlogs fall back to the system maximum.
        let backlog = Backlog::new(backlog).unwrap_or(Backlog::MAXCONN);
        let fail = |errno: nix::errno::Errno| Error::Transport(format!("listen on {}: {}", addr, errno));

        let (socket, addr) = match addr {
            ListenAddr::Unix(path) => {
                remove_stale(path)?;
                let fd = new_socket(AddressFamily::Unix).map_err(fail)?;
                let sockaddr = UnixAddr::new(path.as_path()).map_err(fail)?;
                bind(fd.as_raw_fd(), &sockaddr).map_err(fail)?;
                listen(&fd, backlog).map_err(fail)?;
                (Socket::Unix(UnixListener::from(fd)), ListenAddr::Unix(path.clone()))
            }
            ListenAddr::Tcp(sa) => {
                let family = if sa.is_ipv4() {
                    AddressFamily::Inet
                } else {
                    AddressFamily::Inet6
                };
                let fd = new_socket(family).map_err(fail)?;
                setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(fail)?;
                bind(fd.as_raw_fd(), &SockaddrStorage::from(*sa)).map_err(fail)?;
                listen(&fd, backlog).map_err(fail)?;
                let listener = TcpListener::from(fd);
                // Port 0 picks a free port; report the real one.
                let bound = listener.local_addr()?;
                (Socket::Tcp(listener), ListenAddr::Tcp(bound))
            }
        };
        tracing::info!(addr = %addr, "listening for stream peers");
        Ok(Self {
            socket,
            addr,
            max_frame_size,
            owner: nix::unistd::getpid(),
        })
    }

    /// The bound address, with the actual port for TCP.
    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    pub(crate) fn poll_fd(&self) -> BorrowedFd<'_> {
        match &self.socket {
            Socket::Unix(l) => l.as_fd(),
            Socket::Tcp(l) => l.as_fd(),
        }
    }

    /// Take one pending connection; `WouldBlock` when another worker won it.
    pub(crate) fn accept(&self) -> io::Result<PeerConnection> {
        let stream = match &self.socket {
            Socket::Unix(l) => PeerStream::Unix(l.accept()?.0),
            Socket::Tcp(l) => PeerStream::Tcp(l.accept()?.0),
        };
        stream.configure()?;
        Ok(PeerConnection {
            stream,
            max_frame_size: self.max_frame_size,
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if nix::unistd::getpid() != self.owner {
            return;
        }
        if let ListenAddr::Unix(path) = &self.addr {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(path = %path.display(), "failed to remove socket file: {}", e);
            }
        }
    }
}

fn new_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Transport(format!(
            "cannot replace socket file {}: {}",
            path.display(),
            e
        ))),
    }
}

enum PeerStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl PeerStream {
    fn configure(&self) -> io::Result<()> {
        match self {
            PeerStream::Unix(s) => {
                s.set_nonblocking(false)?;
                s.set_read_timeout(Some(PEER_READ_TIMEOUT))
            }
            PeerStream::Tcp(s) => {
                s.set_nonblocking(false)?;
                s.set_nodelay(true)?;
                s.set_read_timeout(Some(PEER_READ_TIMEOUT))
            }
        }
    }
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PeerStream::Unix(s) => s.read(buf),
            PeerStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            PeerStream::Unix(s) => s.write(buf),
            PeerStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PeerStream::Unix(s) => s.flush(),
            PeerStream::Tcp(s) => s.flush(),
        }
    }
}

/// One accepted external peer.
pub struct PeerConnection {
    stream: PeerStream,
    max_frame_size: usize,
}

impl PeerConnection {
    /// Read until one request frame is complete. `None` when the peer hangs
    /// up first.
    pub(crate) fn read_request(&mut self, buf: &mut [u8]) -> Result<Option<TaskMessage>> {
        let mut codec = StreamCodec::new(self.max_frame_size);
        loop {
            let n = match self.stream.read(buf) {
                Ok(0) => return Ok(None),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(format!("peer read: {}", e))),
            };
            if let Some(message) = codec.decode(&buf[..n])?.into_iter().next() {
                return Ok(Some(message));
            }
        }
    }

    /// Write one reply frame.
    pub(crate) fn send_frame(&mut self, payload: &[u8]) -> Result<usize> {
        let frame = encode_stream_frame(payload, self.max_frame_size)?;
        self.stream
            .write_all(&frame)
            .map_err(|e| Error::Transport(format!("peer write: {}", e)))?;
        Ok(frame.len())
    }
}

/// Send one request frame to a listening pool and collect every reply frame
/// until the worker closes the connection.
pub fn request(addr: &ListenAddr, payload: &[u8], max_frame_size: usize) -> Result<Vec<Vec<u8>>> {
    let mut stream = match addr {
        ListenAddr::Unix(path) => PeerStream::Unix(UnixStream::connect(path)?),
        ListenAddr::Tcp(sa) => PeerStream::Tcp(TcpStream::connect(sa)?),
    };
    stream.write_all(&encode_stream_frame(payload, max_frame_size)?)?;

    let mut codec = StreamCodec::new(max_frame_size);
    let mut replies = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        replies.extend(codec.decode(&buf[..n])?.into_iter().map(|m| m.payload));
    }
    if codec.is_mid_frame() {
        return Err(Error::Protocol("connection closed inside a reply frame".to_string()));
    }
    Ok(replies)
}
