//! In-memory shard backend.

use std::collections::HashMap;
use std::sync::RwLock;

use ringlet_types::Chunk;
use tracing::trace;

use crate::traits::ShardStore;

/// In-memory shard backed by a `RwLock<HashMap>`.
///
/// Unbounded and never evicts: a chunk stays until it is overwritten or
/// deleted, or the process exits.
#[derive(Debug, Default)]
pub struct MemoryShard {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryShard {
    /// Create an empty shard.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardStore for MemoryShard {
    fn put(&self, chunk: Chunk) -> Option<Chunk> {
        let mut map = self.chunks.write().expect("shard lock poisoned");
        trace!(label = chunk.label(), size = chunk.len(), "storing chunk in memory");
        map.insert(chunk.label().to_string(), chunk)
    }

    fn get(&self, label: &str) -> Option<Chunk> {
        let map = self.chunks.read().expect("shard lock poisoned");
        map.get(label).cloned()
    }

    fn delete(&self, label: &str) -> Option<Chunk> {
        let mut map = self.chunks.write().expect("shard lock poisoned");
        let removed = map.remove(label);
        if removed.is_some() {
            trace!(label, "deleted chunk from memory");
        }
        removed
    }

    fn count(&self) -> usize {
        self.chunks.read().expect("shard lock poisoned").len()
    }
}
