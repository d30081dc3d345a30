//! IPC transports connecting the master to its workers.
//!
//! A [`Transport`] owns the endpoints for a whole pool. Each endpoint is a
//! [`Channel`]; the master writes tasks to its side and the worker reads them
//! from the other side (and writes replies back the same way).
//!
//! | mode            | endpoints                         | dispatch          |
//! |-----------------|-----------------------------------|-------------------|
//! | `UnixSocket`    | one datagram socketpair per worker | point-to-point    |
//! | `MsgQueue`      | one System V queue for everybody   | any free consumer |
//! | `StreamSocket`  | one stream socketpair per worker   | point-to-point    |
//! | `None`          | nothing; the pool runs a custom main loop |            |

mod listener;
mod msgqueue;
mod pipe;
mod socket;

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use listener::{ListenAddr, Listener, PeerConnection, request};
pub use msgqueue::{MsgQueue, MsgQueueEndpoint};
pub use pipe::PipeEndpoint;
pub use socket::SocketEndpoint;

/// Which channel the pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMode {
    None,
    UnixSocket,
    MsgQueue,
    StreamSocket,
}

impl IpcMode {
    /// Whether one write arrives as exactly one read on the other side.
    pub fn preserves_boundaries(self) -> bool {
        !matches!(self, IpcMode::StreamSocket)
    }

    /// Whether the master chooses the destination worker itself.
    pub fn is_point_to_point(self) -> bool {
        matches!(self, IpcMode::UnixSocket | IpcMode::StreamSocket)
    }
}

/// One side of an IPC connection.
///
/// Blocking calls return `ErrorKind::Interrupted` when a signal arrives so the
/// caller's loop can notice a stop request.
pub trait Channel: Send + Sync {
    /// Write one packet, waiting for room if necessary.
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Write one packet, or fail with `WouldBlock` if it cannot be accepted now.
    fn try_send(&self, data: &[u8]) -> io::Result<usize>;

    /// Write as much of `data` as fits right now and return how much that was.
    /// Packet channels accept a packet whole or not at all.
    fn try_send_some(&self, data: &[u8]) -> io::Result<usize> {
        self.try_send(data)
    }

    /// Read the next packet (or the next bytes, for stream channels).
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read without waiting; `WouldBlock` when nothing is queued.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Descriptor to poll for readiness, if the channel has one.
    fn poll_fd(&self) -> Option<BorrowedFd<'_>>;
}

/// Master-side and worker-side handles of one connection.
#[derive(Clone)]
pub struct EndpointPair {
    pub master: Arc<dyn Channel>,
    pub worker: Arc<dyn Channel>,
}

/// All endpoints of a pool.
pub struct Transport {
    mode: IpcMode,
    endpoints: Vec<EndpointPair>,
}

impl Transport {
    /// Allocate endpoints for `worker_num` workers.
    pub fn create(mode: IpcMode, worker_num: usize, msgqueue_key: i32) -> Result<Self> {
        let mut endpoints = Vec::new();
        match mode {
            IpcMode::None => {}
            IpcMode::UnixSocket | IpcMode::StreamSocket => {
                for _ in 0..worker_num {
                    endpoints.push(Self::socketpair(mode)?);
                }
            }
            IpcMode::MsgQueue => {
                let queue = Arc::new(MsgQueue::open(msgqueue_key)?);
                endpoints.push(EndpointPair {
                    master: Arc::new(MsgQueueEndpoint::master(queue.clone())),
                    worker: Arc::new(MsgQueueEndpoint::worker(queue)),
                });
            }
        }
        tracing::debug!(?mode, endpoints = endpoints.len(), "transport created");
        Ok(Self { mode, endpoints })
    }

    fn socketpair(mode: IpcMode) -> Result<EndpointPair> {
        let pair = if mode == IpcMode::StreamSocket {
            let (master, worker) = SocketEndpoint::pair()?;
            EndpointPair {
                master: Arc::new(master),
                worker: Arc::new(worker),
            }
        } else {
            let (master, worker) = PipeEndpoint::pair()?;
            EndpointPair {
                master: Arc::new(master),
                worker: Arc::new(worker),
            }
        };
        Ok(pair)
    }

    /// Give `slot` a fresh point-to-point connection and return the old one.
    pub fn renew(&mut self, slot: usize) -> Result<EndpointPair> {
        if !self.mode.is_point_to_point() {
            return Err(Error::Unsupported(format!(
                "{:?} transport has no per-worker endpoints",
                self.mode
            )));
        }
        let fresh = Self::socketpair(self.mode)?;
        let current = self
            .endpoints
            .get_mut(slot)
            .ok_or_else(|| Error::State(format!("no endpoint for slot {}", slot)))?;
        Ok(std::mem::replace(current, fresh))
    }

    /// Build a transport from pre-made endpoints.
    pub fn from_endpoints(mode: IpcMode, endpoints: Vec<EndpointPair>) -> Self {
        Self { mode, endpoints }
    }

    pub fn mode(&self) -> IpcMode {
        self.mode
    }

    fn pair(&self, slot: usize) -> Option<&EndpointPair> {
        match self.mode {
            IpcMode::MsgQueue => self.endpoints.first(),
            _ => self.endpoints.get(slot),
        }
    }

    /// Master-side endpoint for the worker in `slot`.
    pub fn master(&self, slot: usize) -> Option<&Arc<dyn Channel>> {
        self.pair(slot).map(|p| &p.master)
    }

    /// Worker-side endpoint for the worker in `slot`.
    pub fn worker(&self, slot: usize) -> Option<&Arc<dyn Channel>> {
        self.pair(slot).map(|p| &p.worker)
    }

    /// Every distinct master-side endpoint, with the slot it belongs to.
    pub fn master_endpoints(&self) -> impl Iterator<Item = (usize, &Arc<dyn Channel>)> {
        self.endpoints.iter().enumerate().map(|(i, p)| (i, &p.master))
    }
}

/// How long a writer without a pollable descriptor sleeps before retrying.
const FULL_RETRY: Duration = Duration::from_millis(5);

/// Write encoded packets to a channel in order.
///
/// `segment` splits each packet into pieces of at most that many bytes; it is
/// used when stream frames ride on a datagram channel. Whenever the channel is
/// full `on_full` runs before the next attempt; the master uses it to read
/// replies so a worker blocked on its own reply can make room. In non-blocking
/// mode only the first write may fail with `WouldBlock`: once part of a
/// message is out, the rest follows so the peer never sees a torn message.
pub(crate) fn write_packets(
    channel: &dyn Channel,
    packets: &[Vec<u8>],
    segment: Option<usize>,
    blocking: bool,
    on_full: &mut dyn FnMut() -> io::Result<()>,
) -> io::Result<usize> {
    let mut written = 0;
    for packet in packets {
        let step = segment.unwrap_or(packet.len()).max(1);
        for piece in packet.chunks(step) {
            let mut offset = 0;
            while offset < piece.len() {
                match channel.try_send_some(&piece[offset..]) {
                    Ok(n) => {
                        offset += n;
                        written += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if written == 0 && !blocking {
                            return Err(e);
                        }
                        on_full()?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(written)
}

/// Wait up to `timeout` for `channel` to accept more data.
pub(crate) fn wait_writable(channel: &dyn Channel, timeout: Duration) -> io::Result<()> {
    match channel.poll_fd() {
        Some(fd) => wait_ready(&[], Some(fd), timeout).map(drop),
        None => {
            std::thread::sleep(FULL_RETRY.min(timeout));
            Ok(())
        }
    }
}

/// Wait until at least one of `fds` is readable or `timeout` passes.
///
/// Returns the indexes of the readable descriptors. A signal interrupting the
/// wait yields an empty list so the caller can check its flags.
pub(crate) fn poll_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<usize>> {
    wait_ready(fds, None, timeout)
}

/// Wait until one of `readers` is readable, `writer` is writable, or
/// `timeout` passes. Returns the indexes of the readable `readers`.
pub(crate) fn wait_ready(
    readers: &[BorrowedFd<'_>],
    writer: Option<BorrowedFd<'_>>,
    timeout: Duration,
) -> io::Result<Vec<usize>> {
    let mut pollfds: Vec<PollFd<'_>> = readers
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    if let Some(fd) = writer {
        pollfds.push(PollFd::new(fd, PollFlags::POLLOUT));
    }
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    match poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Vec::new()),
        Err(errno) => return Err(errno.into()),
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .take(readers.len())
        .enumerate()
        .filter(|(_, p)| p.revents().is_some_and(|r| r.intersects(ready)))
        .map(|(i, _)| i)
        .collect())
}

/// Convert a libc return value into an `io::Result`.
pub(crate) fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Map an I/O failure on an endpoint into the crate error.
pub(crate) fn transport_error(context: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::WouldBlock {
        Error::WouldBlock
    } else {
        Error::Transport(format!("{}: {}", context, err))
    }
}
