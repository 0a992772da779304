//! Error types for network operations.

/// Errors that can occur while framing, decoding or transporting messages.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote address.
    #[error("connection error: {0}")]
    Connect(String),

    /// Connecting did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// Socket-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be split into header lines and payload.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// A frame parsed but did not describe a valid protocol message.
    #[error("protocol decode error: {0}")]
    Decode(String),

    /// A header key or value cannot be represented on the wire.
    #[error("unencodable header {key:?}: {reason}")]
    Encode {
        /// The offending header key.
        key: String,
        /// Why it was refused.
        reason: &'static str,
    },

    /// A buffered frame grew past the size limit.
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// The session was closed before the operation completed.
    #[error("session closed")]
    SessionClosed,
}
