//! Datagram socketpair endpoints.
//!
//! Each write is delivered as one datagram, so packet boundaries survive
//! without extra framing.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;

use nix::sys::socket::{MsgFlags, recv, send};

use super::Channel;

pub struct PipeEndpoint {
    socket: UnixDatagram,
}

impl PipeEndpoint {
    /// Create a connected pair of endpoints.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixDatagram::pair()?;
        Ok((Self { socket: a }, Self { socket: b }))
    }
}

impl Channel for PipeEndpoint {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data)
    }

    fn try_send(&self, data: &[u8]) -> io::Result<usize> {
        Ok(send(self.socket.as_raw_fd(), data, MsgFlags::MSG_DONTWAIT)?)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(recv(self.socket.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT)?)
    }

    fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.socket.as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagrams_keep_boundaries() {
        let (a, b) = PipeEndpoint::pair().unwrap();
        a.send(b"first").unwrap();
        a.send(b"second").unwrap();

        let mut buf = [0u8; 64];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_bidirectional() {
        let (a, b) = PipeEndpoint::pair().unwrap();
        b.try_send(b"reply").unwrap();
        let mut buf = [0u8; 16];
        let n = a.try_recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[test]
    fn test_peer_closed() {
        let (a, b) = PipeEndpoint::pair().unwrap();
        drop(b);
        let err = a.try_send(b"lost").unwrap_err();
        assert!(crate::error::Error::is_peer_gone(&err));
    }
}
