//! Raw datagram socket and send-failure classification.
//!
//! The socket is an unbound, connectionless `SOCK_DGRAM` descriptor created
//! through rustix. Sends go through `sendto` with caller-provided flags so the
//! non-blocking policy stays a configuration decision rather than a socket
//! mode.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use rustix::io::Errno;
use rustix::net::addr::SocketAddrArg;
use rustix::net::{AddressFamily, SendFlags, SocketFlags, SocketType};
use thiserror::Error;

/// A connectionless datagram socket.
#[derive(Debug)]
pub struct DatagramSocket {
    fd: OwnedFd,
}

impl DatagramSocket {
    /// Opens a close-on-exec datagram socket in the given address family.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the socket cannot be created.
    pub fn open(family: AddressFamily) -> Result<Self, Errno> {
        let fd = rustix::net::socket_with(family, SocketType::DGRAM, SocketFlags::CLOEXEC, None)?;
        Ok(Self { fd })
    }

    /// Sends one datagram to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the raw OS error; see [`classify_send_error`] for what it means
    /// to the dispatch loop.
    #[inline]
    pub fn send_to(
        &self,
        buf: &[u8],
        flags: SendFlags,
        addr: &impl SocketAddrArg,
    ) -> Result<usize, Errno> {
        rustix::net::sendto(&self.fd, buf, flags, addr)
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), Errno> {
        rustix::net::sockopt::set_socket_send_buffer_size(&self.fd, size)
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> Result<usize, Errno> {
        rustix::net::sockopt::socket_send_buffer_size(&self.fd)
    }
}

impl AsFd for DatagramSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Something the dispatch loop can hand a payload to.
///
/// Implemented by [`DestinationSocket`](super::DestinationSocket); tests use
/// scripted sinks to drive every classification.
pub trait DatagramSink {
    /// Attempts exactly one send of `payload`.
    ///
    /// # Errors
    ///
    /// Returns the raw OS error reported by the send.
    fn send_datagram(&mut self, payload: &[u8]) -> Result<usize, Errno>;
}

/// A send failure that ends the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The descriptor is closed or not a socket. Recovering would need a new
    /// setup, which the worker does not attempt.
    #[error("invalid socket handle: {0}")]
    BadDescriptor(Errno),
    /// Any send error without a more specific classification.
    #[error("send failed: {} (errno {})", .0, .0.raw_os_error())]
    Other(Errno),
}

/// What a single send attempt means to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The kernel accepted this many bytes.
    Sent(usize),
    /// No buffer space right now; expected under load with `MSG_DONTWAIT`.
    WouldBlock,
    /// No peer on the other end. Datagram sockets carry no connection state,
    /// so there is nothing to tear down.
    Refused,
    /// The loop must stop.
    Fatal(SendError),
}

impl SendOutcome {
    /// Classifies the result of one send.
    #[inline]
    #[must_use]
    pub fn from_result(result: Result<usize, Errno>) -> Self {
        match result {
            Ok(n) => Self::Sent(n),
            Err(errno) => classify_send_error(errno),
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Maps a raw send error to its classification.
///
/// | errno | outcome |
/// |-------|---------|
/// | `EAGAIN`, `EWOULDBLOCK`, `ENOBUFS` | [`SendOutcome::WouldBlock`] |
/// | `ECONNREFUSED`, `ENOENT` | [`SendOutcome::Refused`] |
/// | `EBADF`, `ENOTSOCK` | [`SendError::BadDescriptor`] |
/// | anything else | [`SendError::Other`] |
///
/// `ENOENT` is what a local-domain send reports when nothing is bound at the
/// destination path, which is the same situation as a refused UDP peer.
#[must_use]
pub fn classify_send_error(errno: Errno) -> SendOutcome {
    if errno == Errno::AGAIN || errno == Errno::WOULDBLOCK || errno == Errno::NOBUFS {
        SendOutcome::WouldBlock
    } else if errno == Errno::CONNREFUSED || errno == Errno::NOENT {
        SendOutcome::Refused
    } else if errno == Errno::BADF || errno == Errno::NOTSOCK {
        SendOutcome::Fatal(SendError::BadDescriptor(errno))
    } else {
        SendOutcome::Fatal(SendError::Other(errno))
    }
}
