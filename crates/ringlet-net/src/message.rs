//! Protocol messages exchanged between ringlet nodes.
//!
//! Every message travels as one [`Frame`]. Requests and responses share a
//! type; a response is the request's serial number echoed back with a
//! `Status` header added.

use bytes::Bytes;
use ringlet_types::{Chunk, NodeAddr, RingHash, Status};

use crate::error::NetError;
use crate::frame::Frame;

/// Header naming the message kind.
pub const PROTOCOL_KEY: &str = "Protocol";
/// Header carrying the request serial number.
pub const SN_KEY: &str = "SN";
/// Header carrying the response status.
pub const STATUS_KEY: &str = "Status";

const IDENTITY_KEY: &str = "Identity";
const ADDRESS_KEY: &str = "Address";
const HASH_KEY: &str = "Hash";
const TARGET_KEY: &str = "Target";
const LABEL_KEY: &str = "Label";

/// Membership handshake.
///
/// The request describes the requester; the response describes the
/// responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discover {
    /// Request serial number.
    pub sn: u64,
    /// Present on responses only.
    pub status: Option<Status>,
    /// Random per-process tag of the sender, used to detect self-discovery.
    pub identity: String,
    /// Address the sender listens on.
    pub addr: NodeAddr,
    /// Sender's ring position.
    pub hash: RingHash,
}

impl Discover {
    /// Build a discovery request describing the local node.
    pub fn request(sn: u64, identity: &str, addr: NodeAddr, hash: RingHash) -> Self {
        Self {
            sn,
            status: None,
            identity: identity.to_string(),
            addr,
            hash,
        }
    }

    /// Build the response to this request, describing the responder.
    pub fn respond(&self, status: Status, identity: &str, addr: NodeAddr, hash: RingHash) -> Self {
        Self {
            sn: self.sn,
            status: Some(status),
            identity: identity.to_string(),
            addr,
            hash,
        }
    }
}

/// Store a chunk on its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    /// Request serial number.
    pub sn: u64,
    /// Present on responses only.
    pub status: Option<Status>,
    /// Ring position of the node the sender believes owns the chunk.
    pub target: RingHash,
    /// Chunk label.
    pub label: String,
    /// Chunk bytes (empty on responses).
    pub data: Bytes,
}

impl Push {
    /// Build a push request for `chunk`, addressed to `target`.
    pub fn request(sn: u64, target: RingHash, chunk: &Chunk) -> Self {
        Self {
            sn,
            status: None,
            target,
            label: chunk.label().to_string(),
            data: chunk.data().clone(),
        }
    }

    /// Build the response to this request.
    pub fn respond(&self, status: Status) -> Self {
        Self {
            sn: self.sn,
            status: Some(status),
            target: self.target,
            label: self.label.clone(),
            data: Bytes::new(),
        }
    }

    /// The carried chunk.
    pub fn chunk(&self) -> Chunk {
        Chunk::from_bytes(self.label.clone(), self.data.clone())
    }
}

/// Fetch a chunk from its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    /// Request serial number.
    pub sn: u64,
    /// Present on responses only.
    pub status: Option<Status>,
    /// Ring position of the node the sender believes owns the chunk.
    pub target: RingHash,
    /// Chunk label.
    pub label: String,
    /// Chunk bytes, on successful responses.
    pub data: Option<Bytes>,
}

impl Pull {
    /// Build a pull request for `label`, addressed to `target`.
    pub fn request(sn: u64, target: RingHash, label: &str) -> Self {
        Self {
            sn,
            status: None,
            target,
            label: label.to_string(),
            data: None,
        }
    }

    /// Build the response to this request.
    pub fn respond(&self, status: Status, chunk: Option<&Chunk>) -> Self {
        Self {
            sn: self.sn,
            status: Some(status),
            target: self.target,
            label: self.label.clone(),
            data: chunk.map(|c| c.data().clone()),
        }
    }

    /// The returned chunk, if the response carried one.
    pub fn chunk(&self) -> Option<Chunk> {
        self.data
            .as_ref()
            .map(|d| Chunk::from_bytes(self.label.clone(), d.clone()))
    }
}

/// A typed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Membership handshake.
    Discover(Discover),
    /// Chunk store.
    Push(Push),
    /// Chunk fetch.
    Pull(Pull),
}

impl Protocol {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::Discover(_) => "discover",
            Protocol::Push(_) => "push",
            Protocol::Pull(_) => "pull",
        }
    }

    /// Serial number of the request (echoed on responses).
    pub fn sn(&self) -> u64 {
        match self {
            Protocol::Discover(m) => m.sn,
            Protocol::Push(m) => m.sn,
            Protocol::Pull(m) => m.sn,
        }
    }

    /// Response status, `None` on requests.
    pub fn status(&self) -> Option<Status> {
        match self {
            Protocol::Discover(m) => m.status,
            Protocol::Push(m) => m.status,
            Protocol::Pull(m) => m.status,
        }
    }

    /// Whether this message answers a request.
    pub fn is_response(&self) -> bool {
        self.status().is_some()
    }

    /// Convert to a frame.
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::new()
            .header(PROTOCOL_KEY, self.kind())
            .header(SN_KEY, self.sn());
        if let Some(status) = self.status() {
            frame = frame.header(STATUS_KEY, status);
        }

        match self {
            Protocol::Discover(m) => frame
                .header(IDENTITY_KEY, &m.identity)
                .header(ADDRESS_KEY, &m.addr)
                .header(HASH_KEY, m.hash),
            Protocol::Push(m) => {
                let frame = frame
                    .header(TARGET_KEY, m.target)
                    .header(LABEL_KEY, &m.label);
                if m.status.is_none() {
                    frame.with_payload(m.data.clone())
                } else {
                    frame
                }
            }
            Protocol::Pull(m) => {
                let frame = frame
                    .header(TARGET_KEY, m.target)
                    .header(LABEL_KEY, &m.label);
                match &m.data {
                    Some(data) => frame.with_payload(data.clone()),
                    None => frame,
                }
            }
        }
    }

    /// Build a typed message from a parsed frame.
    ///
    /// Returns `Ok(None)` for an unknown message kind, and an error when a
    /// known kind is missing fields or carries unparsable values.
    pub fn from_frame(frame: &Frame) -> Result<Option<Protocol>, NetError> {
        let kind = required(frame, PROTOCOL_KEY)?;
        let sn = parse_field::<u64>(frame, SN_KEY)?;
        let status = match frame.get(STATUS_KEY) {
            Some(s) => Some(s.parse::<Status>().map_err(NetError::Decode)?),
            None => None,
        };

        let protocol = match kind {
            "discover" => Protocol::Discover(Discover {
                sn,
                status,
                identity: required(frame, IDENTITY_KEY)?.to_string(),
                addr: parse_field(frame, ADDRESS_KEY)?,
                hash: parse_field(frame, HASH_KEY)?,
            }),
            "push" => Protocol::Push(Push {
                sn,
                status,
                target: parse_field(frame, TARGET_KEY)?,
                label: required(frame, LABEL_KEY)?.to_string(),
                data: frame.payload().cloned().unwrap_or_default(),
            }),
            "pull" => Protocol::Pull(Pull {
                sn,
                status,
                target: parse_field(frame, TARGET_KEY)?,
                label: required(frame, LABEL_KEY)?.to_string(),
                data: frame.payload().cloned(),
            }),
            _ => return Ok(None),
        };
        Ok(Some(protocol))
    }
}

fn required<'a>(frame: &'a Frame, key: &str) -> Result<&'a str, NetError> {
    frame
        .get(key)
        .ok_or_else(|| NetError::Decode(format!("missing {key} header")))
}

fn parse_field<T>(frame: &Frame, key: &str) -> Result<T, NetError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    required(frame, key)?
        .parse::<T>()
        .map_err(|e| NetError::Decode(format!("bad {key} header: {e}")))
}

/// A request that could not be delivered, raised locally when a connector dies.
///
/// Never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Ring position of the unreachable peer.
    pub remote: RingHash,
    /// Address of the unreachable peer.
    pub addr: NodeAddr,
    /// The request that was still queued, if any.
    pub original: Option<Protocol>,
    /// Human-readable cause, e.g. "peer disappeared".
    pub reason: String,
}
