//! Text-header frames with an optional binary payload.
//!
//! A frame on the wire is a block of `Key: Value\n` lines, optionally
//! followed by [`PAYLOAD_SEPARATOR`] and raw payload bytes, and always
//! terminated by [`TERMINATOR`]:
//!
//! ```text
//! Protocol: push\n
//! SN: 7\n
//! Payload: 5\n
//! \0PAYLOAD\0hello\r\n\r\n
//! ```
//!
//! The `Payload` header carries the payload length, so a payload that
//! happens to contain the terminator is still delimited correctly.
//!
//! [`FrameAssembler`] rebuilds frames from arbitrary transport deliveries,
//! keeping one buffer per session.

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};

use crate::error::NetError;
use crate::transport::SessionId;

/// Marks the end of a frame.
pub const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Separates the header block from the payload.
pub const PAYLOAD_SEPARATOR: &[u8] = b"\0PAYLOAD\0";

/// Reserved header holding the payload length in bytes.
pub const PAYLOAD_KEY: &str = "Payload";

/// Largest frame the assembler will buffer: 64 MB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A parsed frame: header map plus optional payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    headers: BTreeMap<String, String>,
    payload: Option<Bytes>,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header (builder style).
    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach a payload (builder style).
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Look up a header value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// All headers.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The payload, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Serialize to wire bytes.
    ///
    /// Fails if a header cannot survive the round trip: keys must not be
    /// empty or contain `:`, and neither keys nor values may contain line
    /// breaks, NUL bytes, or leading/trailing whitespace.
    pub fn encode(&self) -> Result<Bytes, NetError> {
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len());
        let mut out = BytesMut::with_capacity(128 + payload_len);

        for (key, value) in &self.headers {
            if key == PAYLOAD_KEY {
                continue;
            }
            check_header(key, value)?;
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\n");
        }

        if let Some(payload) = &self.payload {
            out.extend_from_slice(format!("{PAYLOAD_KEY}: {}\n", payload.len()).as_bytes());
            out.extend_from_slice(PAYLOAD_SEPARATOR);
            out.extend_from_slice(payload);
        }

        out.extend_from_slice(TERMINATOR);
        Ok(out.freeze())
    }
}

fn check_header(key: &str, value: &str) -> Result<(), NetError> {
    let refuse = |reason| {
        Err(NetError::Encode {
            key: key.to_string(),
            reason,
        })
    };
    let forbidden = |s: &str| s.contains(['\n', '\r', '\0']);

    if key.is_empty() || key.contains(':') || key.trim() != key {
        return refuse("invalid key");
    }
    if forbidden(key) || forbidden(value) {
        return refuse("contains a line break or NUL");
    }
    if value.trim() != value {
        return refuse("value has leading or trailing whitespace");
    }
    Ok(())
}

/// Parse the bytes of exactly one complete frame, terminator included.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, NetError> {
    let body = bytes
        .strip_suffix(TERMINATOR)
        .ok_or_else(|| NetError::Frame("missing terminator".into()))?;

    let (header_block, payload) = match find(body, PAYLOAD_SEPARATOR) {
        Some(at) => (
            &body[..at],
            Some(Bytes::copy_from_slice(&body[at + PAYLOAD_SEPARATOR.len()..])),
        ),
        None => (body, None),
    };

    let headers = parse_headers(header_block)?;

    if let Some(payload) = &payload {
        let declared = declared_payload_len(&headers)?;
        if declared != payload.len() {
            return Err(NetError::Frame(format!(
                "payload length mismatch: declared {declared}, got {}",
                payload.len()
            )));
        }
    }

    Ok(Frame { headers, payload })
}

fn parse_headers(block: &[u8]) -> Result<BTreeMap<String, String>, NetError> {
    let text =
        std::str::from_utf8(block).map_err(|_| NetError::Frame("header is not utf-8".into()))?;

    let mut headers = BTreeMap::new();
    for line in text.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| NetError::Frame(format!("header line without ':': {line:?}")))?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn declared_payload_len(headers: &BTreeMap<String, String>) -> Result<usize, NetError> {
    headers
        .get(PAYLOAD_KEY)
        .ok_or_else(|| NetError::Frame("payload without length header".into()))?
        .parse::<usize>()
        .map_err(|e| NetError::Frame(format!("bad payload length: {e}")))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Where the header block of a buffered frame ends.
enum HeaderEnd {
    /// The frame has no payload and ends at this terminator offset.
    Terminator(usize),
    /// A payload separator starts at this offset.
    Separator(usize),
}

/// What the front of a session buffer holds.
enum Boundary {
    /// Not enough bytes yet. Carries the full frame length once the
    /// header has declared it.
    Incomplete(Option<usize>),
    /// A complete frame of this many bytes.
    Complete(usize),
    /// Garbage: drop this many bytes and report the error.
    Corrupt(usize, NetError),
}

/// Per-session reassembly of frames from transport deliveries.
///
/// Deliveries that do not complete a frame are buffered; a delivery that
/// completes one releases the concatenated bytes for parsing. Several
/// frames in one delivery are all returned, in order; a trailing partial
/// frame stays buffered.
#[derive(Debug)]
pub struct FrameAssembler {
    buffers: HashMap<SessionId, BytesMut>,
    max_frame_size: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameAssembler {
    /// Create an assembler with no buffered sessions.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_limit(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            ..Self::default()
        }
    }

    /// Feed a delivery for `session` and collect every frame it completes.
    ///
    /// Malformed frames come back as `Err` entries; the assembler skips
    /// past them and keeps going.
    pub fn push(&mut self, session: SessionId, data: &[u8]) -> Vec<Result<Frame, NetError>> {
        let buf = self.buffers.entry(session).or_default();
        buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match locate(buf, self.max_frame_size) {
                // A declared length is already capped by `locate`.
                Boundary::Incomplete(None) if buf.len() > self.max_frame_size => {
                    frames.push(Err(NetError::TooLarge(buf.len())));
                    buf.clear();
                    break;
                }
                Boundary::Incomplete(_) => break,
                Boundary::Complete(len) => {
                    let bytes = buf.split_to(len);
                    frames.push(parse_frame(&bytes));
                }
                Boundary::Corrupt(skip, err) => {
                    let _ = buf.split_to(skip.min(buf.len()));
                    frames.push(Err(err));
                }
            }
        }

        if buf.is_empty() {
            self.buffers.remove(&session);
        }
        frames
    }

    /// Drop everything buffered for `session`.
    pub fn release(&mut self, session: SessionId) {
        self.buffers.remove(&session);
    }

    /// Bytes currently buffered for `session`.
    pub fn buffered(&self, session: SessionId) -> usize {
        self.buffers.get(&session).map_or(0, BytesMut::len)
    }
}

fn header_end(buf: &[u8]) -> Option<HeaderEnd> {
    (0..buf.len()).find_map(|i| match buf[i] {
        b'\r' if buf[i..].starts_with(TERMINATOR) => Some(HeaderEnd::Terminator(i)),
        0 if buf[i..].starts_with(PAYLOAD_SEPARATOR) => Some(HeaderEnd::Separator(i)),
        _ => None,
    })
}

fn locate(buf: &[u8], max_frame_size: usize) -> Boundary {
    match header_end(buf) {
        None => Boundary::Incomplete(None),
        Some(HeaderEnd::Terminator(at)) => Boundary::Complete(at + TERMINATOR.len()),
        Some(HeaderEnd::Separator(at)) => {
            let declared = parse_headers(&buf[..at]).and_then(|h| declared_payload_len(&h));
            let len = match declared {
                Ok(len) if len <= max_frame_size => len,
                Ok(len) => return Boundary::Corrupt(buf.len(), NetError::TooLarge(len)),
                Err(e) => return skip_to_terminator(buf, at, e),
            };

            let end = at + PAYLOAD_SEPARATOR.len() + len;
            if buf.len() < end + TERMINATOR.len() {
                Boundary::Incomplete(Some(end + TERMINATOR.len()))
            } else if &buf[end..end + TERMINATOR.len()] == TERMINATOR {
                Boundary::Complete(end + TERMINATOR.len())
            } else {
                skip_to_terminator(
                    buf,
                    at,
                    NetError::Frame("payload not followed by terminator".into()),
                )
            }
        }
    }
}

/// Resynchronize on the next terminator after `from`.
fn skip_to_terminator(buf: &[u8], from: usize, err: NetError) -> Boundary {
    match find(&buf[from..], TERMINATOR) {
        Some(at) => Boundary::Corrupt(from + at + TERMINATOR.len(), err),
        None => Boundary::Incomplete(None),
    }
}
