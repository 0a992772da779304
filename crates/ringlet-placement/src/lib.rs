//! Consistent hashing ring for chunk ownership.
//!
//! A [`PhysicalNode`] is the local participant of the cluster: it knows its
//! own ring position, the siblings it has discovered, and owns the local
//! shards. Ownership of a data hash is resolved with the successor rule:
//! the first ring position clockwise from the hash (wrapping around to the
//! smallest position) owns it.
//!
//! Each physical node occupies exactly one position, derived from its
//! address. Shards are a purely local subdivision and never appear on the
//! ring.

mod node;

pub use node::{NodeInfo, Owner, PhysicalNode};
