//! Shard storage trait and the in-memory backend.
//!
//! A node subdivides its own storage into a fixed number of independent
//! shards. This crate defines the [`ShardStore`] trait each shard
//! implements, along with [`MemoryShard`], an unbounded map of
//! label → [`Chunk`](ringlet_types::Chunk) behind a `RwLock`.

mod memory_store;
mod traits;

pub use memory_store::MemoryShard;
pub use traits::ShardStore;
