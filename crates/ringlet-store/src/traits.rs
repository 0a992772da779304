//! Core trait for shard storage.

use ringlet_types::Chunk;

/// One of a node's local chunk maps.
///
/// Implementations are internally synchronized and must be `Send + Sync`
/// so a shard can be shared between the listener and application tasks
/// without external locking.
pub trait ShardStore: Send + Sync {
    /// Store a chunk, replacing any chunk with the same label.
    ///
    /// Returns the chunk that was replaced, if any.
    fn put(&self, chunk: Chunk) -> Option<Chunk>;

    /// Retrieve a chunk by label.
    fn get(&self, label: &str) -> Option<Chunk>;

    /// Remove a chunk by label, returning it if it was present.
    fn delete(&self, label: &str) -> Option<Chunk>;

    /// Number of chunks currently stored.
    fn count(&self) -> usize;
}
