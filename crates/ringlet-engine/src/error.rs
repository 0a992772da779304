//! Error types for the engine.

use ringlet_net::NetError;

/// Errors surfaced by controller lifecycle operations.
///
/// The data path (`write_chunk` / `read_chunk`) never returns these; it
/// reports failure as `false` / `None`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: NetError,
    },

    /// `startup` was called on a running controller.
    #[error("controller already started")]
    AlreadyStarted,

    /// The operation needs a running controller.
    #[error("controller not started")]
    NotStarted,
}
