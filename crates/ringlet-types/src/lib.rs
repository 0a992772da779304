//! Shared types and identifiers for ringlet.
//!
//! This crate defines the core types used across the workspace:
//! the ring position type ([`RingHash`]) and the two hash functions that
//! place things on the ring ([`hash_address`], [`hash_chunk`]), network
//! addresses ([`NodeAddr`]), the unit of storage ([`Chunk`]), and the
//! response status carried by every protocol reply ([`Status`]).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Ring hashing
// ---------------------------------------------------------------------------

/// A position on the consistent-hashing ring.
///
/// Only the first four bytes of the MD5 digest are used, composed
/// little-endian. Peers exchange this value in decimal on the wire, so the
/// width is part of the protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RingHash(u32);

impl RingHash {
    /// Wrap a raw ring position.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Hash arbitrary bytes onto the ring.
    pub fn from_data(data: &[u8]) -> Self {
        let digest = Md5::digest(data);
        Self(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Return the raw ring position.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for RingHash {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for RingHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

impl fmt::Display for RingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingHash({})", self.0)
    }
}

/// Ring position of a node listening on `host:port`.
pub fn hash_address(host: &str, port: u16) -> RingHash {
    RingHash::from_data(format!("{host}:{port}").as_bytes())
}

/// Ring position of a chunk label.
pub fn hash_chunk(label: &str) -> RingHash {
    RingHash::from_data(label.as_bytes())
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// A `host:port` pair identifying a cluster participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddr {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Ring position derived from this address.
    pub fn hash(&self) -> RingHash {
        hash_address(&self.host, self.port)
    }

    /// The same host on the next port, if one exists.
    ///
    /// Used as the single fallback target when a discovery request is rejected.
    pub fn next_port(&self) -> Option<NodeAddr> {
        self.port
            .checked_add(1)
            .map(|port| NodeAddr::new(self.host.clone(), port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a [`NodeAddr`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    /// No `:` separating host and port.
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    /// The host part is empty.
    #[error("empty host in address {0:?}")]
    EmptyHost(String),

    /// The port is not a valid u16.
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
}

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingPort(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddrParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrParseError::InvalidPort(s.to_string()))?;
        Ok(NodeAddr::new(host, port))
    }
}

impl From<std::net::SocketAddr> for NodeAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        NodeAddr::new(addr.ip().to_string(), addr.port())
    }
}

// ---------------------------------------------------------------------------
// Storage unit
// ---------------------------------------------------------------------------

/// A named, immutable binary blob: the unit of storage.
///
/// Two chunks with the same label occupy the same storage slot; writing one
/// replaces the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    label: String,
    data: Bytes,
}

impl Chunk {
    /// Create a chunk by copying the caller's bytes.
    pub fn new(label: impl Into<String>, data: &[u8]) -> Self {
        Self {
            label: label.into(),
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Create a chunk that takes ownership of an already-owned buffer.
    pub fn from_bytes(label: impl Into<String>, data: Bytes) -> Self {
        Self {
            label: label.into(),
            data,
        }
    }

    /// The chunk's label (its storage key).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The chunk's contents.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Length of the contents in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk has no contents.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Ring position of this chunk.
    pub fn hash(&self) -> RingHash {
        hash_chunk(&self.label)
    }
}

// ---------------------------------------------------------------------------
// Protocol status
// ---------------------------------------------------------------------------

/// Outcome carried by every protocol response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The request was carried out.
    Success,
    /// The request was understood but could not be satisfied (e.g. pull miss).
    Failure,
    /// The responder refuses the request (not the owner, or self-discovery).
    Reject,
}

impl Status {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
            Status::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Status::Success),
            "FAILURE" => Ok(Status::Failure),
            "REJECT" => Ok(Status::Reject),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}
