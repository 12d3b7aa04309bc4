//! Destination resolution and socket setup.

use std::ffi::{CStr, CString, OsStr};
use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use rustix::io::Errno;
use rustix::net::{AddressFamily, SendFlags, SocketAddrUnix};
use thiserror::Error;

use super::socket::{DatagramSink, DatagramSocket};
use crate::config::AddressDomain;
use crate::trace::{error, info};

/// Size of `sockaddr_un::sun_path`, NUL terminator included.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SUN_PATH_CAPACITY: usize = 108;

/// Size of `sockaddr_un::sun_path`, NUL terminator included.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SUN_PATH_CAPACITY: usize = 104;

/// Where payloads are sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A local datagram socket bound at `path` by the receiver.
    Local { path: PathBuf },
    /// A UDP peer; `port` is resolved together with `host`.
    Network { host: String, port: String },
}

/// Failure to set up the destination socket. The worker never starts its loop
/// after one of these.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The local path does not fit in `sun_path` with its terminator.
    #[error("socket path is {len} bytes, sun_path holds {capacity} including NUL")]
    AddressOverflow { len: usize, capacity: usize },
    /// The local path contains a NUL byte.
    #[error("socket path contains a NUL byte: {0:?}")]
    InvalidPath(PathBuf),
    /// Name resolution failed or returned nothing.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolution {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },
    /// The OS refused to create the socket.
    #[error("failed to open {domain} datagram socket: {source}")]
    SocketCreate {
        domain: AddressDomain,
        #[source]
        source: Errno,
    },
}

impl Destination {
    /// The addressing domain of this destination.
    #[must_use]
    pub const fn domain(&self) -> AddressDomain {
        match self {
            Self::Local { .. } => AddressDomain::Unix,
            Self::Network { .. } => AddressDomain::Inet,
        }
    }

    /// Opens a socket for this destination and resolves its address.
    ///
    /// `container_id` only prefixes the log line announcing the destination.
    ///
    /// # Errors
    ///
    /// See [`SetupError`]. A local path is validated before any socket is
    /// opened.
    pub fn setup(
        &self,
        container_id: &str,
        flags: SendFlags,
    ) -> Result<DestinationSocket, SetupError> {
        let result = match self {
            Self::Local { path } => setup_local(path, flags),
            Self::Network { host, port } => setup_network(host, port, flags),
        };

        match &result {
            Ok(dest) => info!(
                domain = %self.domain(),
                "{container_id} ==> ({})",
                dest.peer
            ),
            Err(_e) => error!(
                domain = %self.domain(),
                error = %_e,
                "{container_id}: destination setup failed"
            ),
        }
        result
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "unix:{}", path.display()),
            Self::Network { host, port } => write!(f, "inet:{host}:{port}"),
        }
    }
}

fn setup_local(path: &Path, flags: SendFlags) -> Result<DestinationSocket, SetupError> {
    let addr = local_address(path.as_os_str())?;
    let socket =
        DatagramSocket::open(AddressFamily::UNIX).map_err(|source| SetupError::SocketCreate {
            domain: AddressDomain::Unix,
            source,
        })?;

    Ok(DestinationSocket {
        socket,
        peer: Peer::Local(addr, path.to_path_buf()),
        flags,
    })
}

/// Builds a `sockaddr_un` for `path`, refusing anything that would not fit.
fn local_address(path: &OsStr) -> Result<SocketAddrUnix, SetupError> {
    let bytes = path.as_bytes();
    if bytes.len() >= SUN_PATH_CAPACITY {
        return Err(SetupError::AddressOverflow {
            len: bytes.len(),
            capacity: SUN_PATH_CAPACITY,
        });
    }
    if bytes.contains(&0) {
        return Err(SetupError::InvalidPath(PathBuf::from(path)));
    }
    SocketAddrUnix::new(path).map_err(|_| SetupError::InvalidPath(PathBuf::from(path)))
}

fn setup_network(host: &str, port: &str, flags: SendFlags) -> Result<DestinationSocket, SetupError> {
    let addr = resolve(host, port)?;
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::INET,
        SocketAddr::V6(_) => AddressFamily::INET6,
    };
    let socket = DatagramSocket::open(family).map_err(|source| SetupError::SocketCreate {
        domain: AddressDomain::Inet,
        source,
    })?;

    Ok(DestinationSocket {
        socket,
        peer: Peer::Network(addr),
        flags,
    })
}

/// Resolves `host` and `port` for a datagram socket and returns the first
/// usable candidate.
///
/// `port` goes to the resolver as a service string, so both `"30000"` and
/// names from the services database work. Hints are `AF_UNSPEC`,
/// `SOCK_DGRAM` and `AI_ADDRCONFIG`.
fn resolve(host: &str, port: &str) -> Result<SocketAddr, SetupError> {
    let failed = |source: io::Error| SetupError::Resolution {
        host: host.to_owned(),
        port: port.to_owned(),
        source,
    };
    let c_host =
        CString::new(host).map_err(|e| failed(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let c_port =
        CString::new(port).map_err(|e| failed(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    // SAFETY: `addrinfo` is plain old data; all-zero is a valid empty hint.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_DGRAM;
    hints.ai_flags = libc::AI_ADDRCONFIG;

    let mut head: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: both strings are NUL-terminated and outlive the call; `head` is
    // only read after a zero return.
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut head) };
    if rc != 0 {
        return Err(failed(resolver_error(rc)));
    }

    let candidates = AddrInfoList { head };
    candidates.first_socket_addr().ok_or_else(|| {
        failed(io::Error::new(
            io::ErrorKind::NotFound,
            "resolver returned no addresses",
        ))
    })
}

fn resolver_error(rc: libc::c_int) -> io::Error {
    if rc == libc::EAI_SYSTEM {
        return io::Error::last_os_error();
    }
    // SAFETY: gai_strerror returns a static NUL-terminated string.
    let msg = unsafe { CStr::from_ptr(libc::gai_strerror(rc)) };
    io::Error::other(msg.to_string_lossy().into_owned())
}

/// Owned `getaddrinfo` result, freed on drop.
struct AddrInfoList {
    head: *mut libc::addrinfo,
}

impl AddrInfoList {
    fn first_socket_addr(&self) -> Option<SocketAddr> {
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: `cur` is a node of the list getaddrinfo returned, which
            // stays alive until `self` is dropped.
            let info = unsafe { &*cur };
            if let Some(addr) = socket_addr(info) {
                return Some(addr);
            }
            cur = info.ai_next;
        }
        None
    }
}

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.head.is_null() {
            // SAFETY: `head` came from a successful getaddrinfo and is freed
            // exactly once.
            unsafe { libc::freeaddrinfo(self.head) };
        }
    }
}

fn socket_addr(info: &libc::addrinfo) -> Option<SocketAddr> {
    if info.ai_addr.is_null() {
        return None;
    }
    let len = info.ai_addrlen as usize;
    match info.ai_family {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length say this is a `sockaddr_in`.
            let sin = unsafe { &*info.ai_addr.cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length say this is a `sockaddr_in6`.
            let sin6 = unsafe { &*info.ai_addr.cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Resolved peer address.
#[derive(Debug, Clone)]
enum Peer {
    Local(SocketAddrUnix, PathBuf),
    Network(SocketAddr),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_, path) => write!(f, "{}", path.display()),
            Self::Network(addr) => write!(f, "{}:{}", addr.ip(), addr.port()),
        }
    }
}

/// An open socket paired with the address every payload goes to.
///
/// Written once at setup and read-only afterward. Dropping it closes the
/// descriptor.
#[derive(Debug)]
pub struct DestinationSocket {
    socket: DatagramSocket,
    peer: Peer,
    flags: SendFlags,
}

impl DestinationSocket {
    #[must_use]
    pub fn domain(&self) -> AddressDomain {
        match self.peer {
            Peer::Local(..) => AddressDomain::Unix,
            Peer::Network(_) => AddressDomain::Inet,
        }
    }

    /// Human-readable destination: a path, or `ip:port`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.peer.to_string()
    }

    /// The resolved network address, if this is a UDP destination.
    #[must_use]
    pub fn network_addr(&self) -> Option<SocketAddr> {
        match self.peer {
            Peer::Network(addr) => Some(addr),
            Peer::Local(..) => None,
        }
    }

    #[must_use]
    pub const fn flags(&self) -> SendFlags {
        self.flags
    }

    /// The underlying socket, for socket options.
    #[must_use]
    pub const fn socket(&self) -> &DatagramSocket {
        &self.socket
    }

    /// Sends `payload` to the destination with the configured flags.
    ///
    /// # Errors
    ///
    /// Returns the raw OS error from `sendto`.
    #[inline]
    pub fn send(&self, payload: &[u8]) -> Result<usize, Errno> {
        match &self.peer {
            Peer::Local(addr, _) => self.socket.send_to(payload, self.flags, addr),
            Peer::Network(addr) => self.socket.send_to(payload, self.flags, addr),
        }
    }
}

impl DatagramSink for DestinationSocket {
    fn send_datagram(&mut self, payload: &[u8]) -> Result<usize, Errno> {
        self.send(payload)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, UdpSocket};
    use std::os::unix::net::UnixDatagram;

    use super::*;

    fn nonblocking() -> SendFlags {
        SendFlags::DONTWAIT | SendFlags::NOSIGNAL
    }

    #[test]
    fn local_setup_and_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sg.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        let dest = Destination::Local { path: path.clone() };
        let socket = dest.setup("test", nonblocking()).unwrap();
        assert_eq!(socket.domain(), AddressDomain::Unix);
        assert_eq!(socket.describe(), path.display().to_string());
        assert!(socket.network_addr().is_none());

        assert_eq!(socket.send(b"metrics").unwrap(), 7);
        let mut buf = [0u8; 32];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"metrics");
    }

    #[test]
    fn local_path_at_capacity_overflows() {
        let path = PathBuf::from(format!("/{}", "a".repeat(SUN_PATH_CAPACITY - 1)));
        assert_eq!(path.as_os_str().len(), SUN_PATH_CAPACITY);

        let dest = Destination::Local { path };
        match dest.setup("test", nonblocking()) {
            Err(SetupError::AddressOverflow { len, capacity }) => {
                assert_eq!(len, SUN_PATH_CAPACITY);
                assert_eq!(capacity, SUN_PATH_CAPACITY);
            }
            other => panic!("expected AddressOverflow, got {other:?}"),
        }
    }

    #[cfg(feature = "tracing")]
    #[test]
    fn setup_failures_are_logged_as_setup_failures() {
        use crate::trace::capture::{count, logs_of};

        let (results, lines) = logs_of(|| {
            let local = Destination::Local {
                path: PathBuf::from(format!("/tmp/{}", "p".repeat(300))),
            };
            let network = Destination::Network {
                host: "127.0.0.1".into(),
                port: "not-a-port".into(),
            };
            (
                local.setup("logged", nonblocking()),
                network.setup("logged", nonblocking()),
            )
        });

        assert!(matches!(results.0, Err(SetupError::AddressOverflow { .. })));
        assert!(matches!(results.1, Err(SetupError::Resolution { .. })));
        assert_eq!(count(&lines, "ERROR", "logged: destination setup failed"), 2);
    }

    #[test]
    fn local_path_just_under_capacity_fits() {
        let path = PathBuf::from(format!("/{}", "b".repeat(SUN_PATH_CAPACITY - 2)));
        assert!(local_address(path.as_os_str()).is_ok());
    }

    #[test]
    fn local_path_with_nul_is_invalid() {
        let path = PathBuf::from(OsStr::from_bytes(b"/tmp/sg\0bridge"));
        assert!(matches!(
            local_address(path.as_os_str()),
            Err(SetupError::InvalidPath(_))
        ));
    }

    #[test]
    fn network_setup_and_send() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let dest = Destination::Network {
            host: "127.0.0.1".into(),
            port: port.to_string(),
        };
        let socket = dest.setup("test", nonblocking()).unwrap();
        assert_eq!(socket.domain(), AddressDomain::Inet);
        assert_eq!(socket.describe(), format!("127.0.0.1:{port}"));
        assert_eq!(
            socket.network_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        );

        assert_eq!(socket.send(b"payload").unwrap(), 7);
        let mut buf = [0u8; 32];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn network_setup_ipv6_literal() {
        let dest = Destination::Network {
            host: "::1".into(),
            port: "40000".into(),
        };
        // Hosts without IPv6 are filtered out by AI_ADDRCONFIG or fail at
        // socket creation.
        match dest.setup("test", nonblocking()) {
            Ok(socket) => assert!(socket.network_addr().unwrap().is_ipv6()),
            Err(e) => assert!(
                matches!(
                    e,
                    SetupError::SocketCreate { .. } | SetupError::Resolution { .. }
                ),
                "{e}"
            ),
        }
    }

    #[test]
    fn numeric_port_string_resolves() {
        assert_eq!(
            resolve("127.0.0.1", "30000").unwrap(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 30000))
        );
    }

    #[test]
    fn service_name_port_resolves() {
        // The services database is absent from some minimal images.
        if !Path::new("/etc/services").exists() {
            return;
        }
        let dest = Destination::Network {
            host: "127.0.0.1".into(),
            port: "domain".into(),
        };
        let socket = dest.setup("test", nonblocking()).unwrap();
        assert_eq!(
            socket.network_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 53)))
        );
    }

    #[test]
    fn port_with_nul_is_resolution_error() {
        assert!(matches!(
            resolve("127.0.0.1", "30\0000"),
            Err(SetupError::Resolution { .. })
        ));
    }

    #[test]
    fn bad_port_is_resolution_error() {
        let dest = Destination::Network {
            host: "127.0.0.1".into(),
            port: "not-a-port".into(),
        };
        assert!(matches!(
            dest.setup("test", nonblocking()),
            Err(SetupError::Resolution { .. })
        ));
    }

    #[test]
    fn unresolvable_host_is_resolution_error_every_time() {
        let dest = Destination::Network {
            host: "no-such-host.invalid".into(),
            port: "30000".into(),
        };
        for _ in 0..16 {
            match dest.setup("test", nonblocking()) {
                Err(SetupError::Resolution { host, port, .. }) => {
                    assert_eq!(host, "no-such-host.invalid");
                    assert_eq!(port, "30000");
                }
                other => panic!("expected Resolution, got {other:?}"),
            }
        }
    }

    #[test]
    fn destination_display() {
        let local = Destination::Local {
            path: PathBuf::from("/tmp/smartgateway"),
        };
        assert_eq!(local.to_string(), "unix:/tmp/smartgateway");
        assert_eq!(local.domain(), AddressDomain::Unix);

        let net = Destination::Network {
            host: "collector".into(),
            port: "30000".into(),
        };
        assert_eq!(net.to_string(), "inet:collector:30000");
        assert_eq!(net.domain(), AddressDomain::Inet);
    }
}
