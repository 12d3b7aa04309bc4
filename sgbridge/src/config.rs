//! Worker configuration.
//!
//! [`BridgeConfig`] is the loosely-typed surface handed over by whatever parses
//! the process arguments. [`BridgeConfig::destination`] turns it into a typed
//! [`Destination`], so an unknown domain tag or a missing field is rejected
//! before any socket work happens.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rustix::net::SendFlags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::Destination;

/// Default local socket path used by the smart gateway collector.
pub const DEFAULT_UNIX_PATH: &str = "/tmp/smartgateway";

/// Default identifier used as the log prefix.
pub const DEFAULT_CONTAINER_ID: &str = "sgbridge";

/// Addressing domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressDomain {
    /// Filesystem-path-addressed local datagram socket (`AF_UNIX`).
    Unix,
    /// UDP over IPv4 or IPv6.
    Inet,
}

impl AddressDomain {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Inet => "inet",
        }
    }
}

impl FromStr for AddressDomain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unix" | "local" => Ok(Self::Unix),
            "inet" | "udp" => Ok(Self::Inet),
            _ => Err(ConfigError::UnknownDomain(s.to_owned())),
        }
    }
}

impl fmt::Display for AddressDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors found while validating a [`BridgeConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The domain tag is neither `unix` nor `inet`.
    #[error("unknown addressing domain: {0:?}")]
    UnknownDomain(String),
    /// A field required by the selected domain is empty.
    #[error("{domain} destination requires `{field}`")]
    MissingField {
        domain: AddressDomain,
        field: &'static str,
    },
}

/// Configuration for one send-side worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Identifier used only to prefix log lines.
    pub container_id: String,
    /// Addressing domain tag, kept as text until validated.
    pub domain: String,
    /// Destination path for the `unix` domain.
    pub unix_path: PathBuf,
    /// Destination host for the `inet` domain.
    pub peer_host: String,
    /// Destination port (numeric or service name) for the `inet` domain.
    pub peer_port: String,
    /// Send with `MSG_DONTWAIT`.
    pub nonblocking: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            container_id: DEFAULT_CONTAINER_ID.to_owned(),
            domain: AddressDomain::Unix.as_str().to_owned(),
            unix_path: PathBuf::from(DEFAULT_UNIX_PATH),
            peer_host: String::new(),
            peer_port: String::new(),
            nonblocking: true,
        }
    }
}

impl BridgeConfig {
    /// Validates the domain tag and the fields it needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unknown tag or an empty required field.
    pub fn destination(&self) -> Result<Destination, ConfigError> {
        let domain: AddressDomain = self.domain.parse()?;
        match domain {
            AddressDomain::Unix => {
                if self.unix_path.as_os_str().is_empty() {
                    return Err(ConfigError::MissingField {
                        domain,
                        field: "unix_path",
                    });
                }
                Ok(Destination::Local {
                    path: self.unix_path.clone(),
                })
            }
            AddressDomain::Inet => {
                if self.peer_host.is_empty() {
                    return Err(ConfigError::MissingField {
                        domain,
                        field: "peer_host",
                    });
                }
                if self.peer_port.is_empty() {
                    return Err(ConfigError::MissingField {
                        domain,
                        field: "peer_port",
                    });
                }
                Ok(Destination::Network {
                    host: self.peer_host.clone(),
                    port: self.peer_port.clone(),
                })
            }
        }
    }

    /// Flags passed to every `sendto`.
    #[must_use]
    pub fn send_flags(&self) -> SendFlags {
        // SIGPIPE is never wanted from a datagram send.
        let mut flags = SendFlags::NOSIGNAL;
        if self.nonblocking {
            flags |= SendFlags::DONTWAIT;
        }
        flags
    }
}
