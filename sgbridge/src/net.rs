//! Destination sockets.
//!
//! Two addressing domains are supported: a filesystem-path-addressed local
//! datagram socket and UDP over IPv4/IPv6. Both are reached through
//! [`Destination::setup`], which yields a [`DestinationSocket`] that owns the
//! file descriptor and the resolved peer address.

pub mod destination;
pub mod socket;

pub use destination::{Destination, DestinationSocket, SUN_PATH_CAPACITY, SetupError};
pub use socket::{DatagramSink, DatagramSocket, SendError, SendOutcome, classify_send_error};
