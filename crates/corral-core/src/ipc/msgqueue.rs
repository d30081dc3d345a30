//! System V message queue shared by every worker.
//!
//! Tasks travel as `TASK_TYPE` messages and any idle worker pulls the next
//! one; replies travel back as `REPLY_TYPE` messages to the master.

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::{Channel, cvt};

/// Message type of master-to-worker tasks.
pub const TASK_TYPE: libc::c_long = 1;
/// Message type of worker-to-master replies.
pub const REPLY_TYPE: libc::c_long = 2;

const TYPE_LEN: usize = std::mem::size_of::<libc::c_long>();

/// Largest body the receive buffer accepts; the kernel default `msgmax` is 8192.
const MAX_BODY: usize = 64 * 1024;

/// Handle to a System V message queue.
///
/// The creating process removes the queue when the handle drops.
pub struct MsgQueue {
    id: libc::c_int,
    key: libc::key_t,
    owner: libc::pid_t,
}

impl MsgQueue {
    /// Open (creating if needed) the queue for `key`; `0` creates a private queue.
    pub fn open(key: i32) -> Result<Self> {
        let key = if key == 0 { libc::IPC_PRIVATE } else { key as libc::key_t };
        // SAFETY: msgget takes plain integers.
        let id = unsafe { libc::msgget(key, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(Error::Transport(format!(
                "msgget({}) failed: {}",
                key,
                io::Error::last_os_error()
            )));
        }
        Ok(Self {
            id,
            key,
            owner: nix::unistd::getpid().as_raw(),
        })
    }

    pub fn key(&self) -> i32 {
        self.key as i32
    }

    fn push(&self, mtype: libc::c_long, data: &[u8], flags: libc::c_int) -> io::Result<usize> {
        let mut msg = Vec::with_capacity(TYPE_LEN + data.len());
        msg.extend_from_slice(&mtype.to_ne_bytes());
        msg.extend_from_slice(data);
        loop {
            // SAFETY: `msg` starts with a c_long mtype followed by `data.len()` bytes.
            let ret = unsafe { libc::msgsnd(self.id, msg.as_ptr().cast(), data.len(), flags) };
            if ret == 0 {
                return Ok(data.len());
            }
            let err = io::Error::last_os_error();
            // A blocking push keeps its place on EINTR; only receivers need to observe signals.
            if err.kind() == io::ErrorKind::Interrupted && flags & libc::IPC_NOWAIT == 0 {
                continue;
            }
            return Err(map_nowait(err));
        }
    }

    fn pop(&self, mtype: libc::c_long, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        let body = buf.len().min(MAX_BODY);
        let mut msg = vec![0u8; TYPE_LEN + body];
        // SAFETY: `msg` has room for the mtype plus `body` bytes of text.
        let ret = unsafe {
            libc::msgrcv(self.id, msg.as_mut_ptr().cast(), body, mtype, flags)
        };
        let n = cvt(ret).map_err(map_nowait)?;
        buf[..n].copy_from_slice(&msg[TYPE_LEN..TYPE_LEN + n]);
        Ok(n)
    }
}

/// `IPC_NOWAIT` reports an empty or full queue as `ENOMSG` / `EAGAIN`.
fn map_nowait(err: io::Error) -> io::Error {
    if err.raw_os_error() == Some(libc::ENOMSG) {
        io::Error::from(io::ErrorKind::WouldBlock)
    } else {
        err
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        if nix::unistd::getpid().as_raw() != self.owner {
            return;
        }
        // SAFETY: IPC_RMID ignores the buffer argument.
        let ret = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if ret < 0 {
            tracing::warn!(
                queue = self.id,
                "failed to remove message queue: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// One side of the shared queue: which message type it sends and receives.
pub struct MsgQueueEndpoint {
    queue: Arc<MsgQueue>,
    send_type: libc::c_long,
    recv_type: libc::c_long,
}

impl MsgQueueEndpoint {
    pub fn master(queue: Arc<MsgQueue>) -> Self {
        Self {
            queue,
            send_type: TASK_TYPE,
            recv_type: REPLY_TYPE,
        }
    }

    pub fn worker(queue: Arc<MsgQueue>) -> Self {
        Self {
            queue,
            send_type: REPLY_TYPE,
            recv_type: TASK_TYPE,
        }
    }
}

impl Channel for MsgQueueEndpoint {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.queue.push(self.send_type, data, 0)
    }

    fn try_send(&self, data: &[u8]) -> io::Result<usize> {
        self.queue.push(self.send_type, data, libc::IPC_NOWAIT)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.queue.pop(self.recv_type, buf, 0)
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.queue.pop(self.recv_type, buf, libc::IPC_NOWAIT)
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}
