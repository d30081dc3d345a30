//! Stream socketpair endpoints.
//!
//! Bytes may arrive split or coalesced; the stream protocol reassembles
//! frames on top. `try_send_some` reports partial writes so a writer can
//! service its own inbound side while the peer catches up.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{MsgFlags, recv, send};

use super::Channel;

pub struct SocketEndpoint {
    stream: UnixStream,
}

impl SocketEndpoint {
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }
}

impl Channel for SocketEndpoint {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        (&self.stream).write_all(data)?;
        Ok(data.len())
    }

    fn try_send(&self, data: &[u8]) -> io::Result<usize> {
        let n = self.try_send_some(data)?;
        if n < data.len() {
            (&self.stream).write_all(&data[n..])?;
        }
        Ok(data.len())
    }

    fn try_send_some(&self, data: &[u8]) -> io::Result<usize> {
        Ok(send(self.stream.as_raw_fd(), data, MsgFlags::MSG_DONTWAIT)?)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&self.stream).read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(n)
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = recv(self.stream.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(n)
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.stream.as_fd())
    }
}
