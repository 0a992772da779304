//! Physical node identity, sibling table and ring lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use ringlet_store::{MemoryShard, ShardStore};
use ringlet_types::{NodeAddr, RingHash};
use tracing::{debug, info};

/// Address and ring position of a cluster participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    /// Ring position.
    pub hash: RingHash,
    /// Where the node listens.
    pub addr: NodeAddr,
}

impl NodeInfo {
    /// Build the info for a node, deriving its hash from the address.
    pub fn from_addr(addr: NodeAddr) -> Self {
        Self {
            hash: addr.hash(),
            addr,
        }
    }
}

/// Result of a ring lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// The local node owns the hash.
    Local,
    /// A known sibling owns the hash.
    Sibling(NodeInfo),
}

/// The local cluster participant.
///
/// Holds the sibling table and the ring derived from it. The ring is a
/// sorted array of every sibling hash plus our own, rebuilt in full on each
/// membership change and published as a fresh `Arc` so lookups never see a
/// partially built array.
pub struct PhysicalNode {
    info: NodeInfo,
    /// Known siblings keyed by ring position. Also serializes ring rebuilds.
    siblings: RwLock<BTreeMap<RingHash, NodeInfo>>,
    /// Current ring snapshot, replaced wholesale on change.
    ring: RwLock<Arc<Vec<RingHash>>>,
    /// Local storage subdivisions.
    shards: Vec<Arc<dyn ShardStore>>,
}

impl PhysicalNode {
    /// Create the local node for `addr` with `shard_count` in-memory shards.
    ///
    /// A shard count of zero is raised to one.
    pub fn new(addr: NodeAddr, shard_count: usize) -> Self {
        Self::with_info(NodeInfo::from_addr(addr), shard_count)
    }

    /// Create the local node with an explicit ring position.
    pub fn with_info(info: NodeInfo, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Arc::new(MemoryShard::new()) as Arc<dyn ShardStore>)
            .collect();
        let ring = Arc::new(vec![info.hash]);
        Self {
            info,
            siblings: RwLock::new(BTreeMap::new()),
            ring: RwLock::new(ring),
            shards,
        }
    }

    /// This node's ring position.
    pub fn hash(&self) -> RingHash {
        self.info.hash
    }

    /// This node's advertised address.
    pub fn addr(&self) -> &NodeAddr {
        &self.info.addr
    }

    /// This node's address and ring position.
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add or update a sibling and rebuild the ring.
    ///
    /// Returns `true` if the sibling table changed. A node claiming our own
    /// ring position is ignored.
    pub fn add_sibling(&self, sibling: NodeInfo) -> bool {
        if sibling.hash == self.info.hash {
            debug!(hash = %sibling.hash, addr = %sibling.addr, "ignoring sibling with our own hash");
            return false;
        }

        let mut siblings = self.siblings.write().expect("sibling lock poisoned");
        if siblings.get(&sibling.hash) == Some(&sibling) {
            return false;
        }

        info!(hash = %sibling.hash, addr = %sibling.addr, "sibling added to ring");
        siblings.insert(sibling.hash, sibling);
        self.publish_ring(&siblings);
        true
    }

    /// Whether `hash` belongs to a known sibling.
    pub fn is_sibling(&self, hash: RingHash) -> bool {
        self.siblings
            .read()
            .expect("sibling lock poisoned")
            .contains_key(&hash)
    }

    /// Look up a sibling by ring position.
    pub fn sibling(&self, hash: RingHash) -> Option<NodeInfo> {
        self.siblings
            .read()
            .expect("sibling lock poisoned")
            .get(&hash)
            .cloned()
    }

    /// Snapshot of all known siblings, ordered by ring position.
    pub fn siblings(&self) -> Vec<NodeInfo> {
        self.siblings
            .read()
            .expect("sibling lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Number of known siblings.
    pub fn sibling_count(&self) -> usize {
        self.siblings.read().expect("sibling lock poisoned").len()
    }

    /// Forget every sibling and empty the ring.
    ///
    /// After this every lookup resolves to the local node.
    pub fn clearup(&self) {
        let mut siblings = self.siblings.write().expect("sibling lock poisoned");
        siblings.clear();
        *self.ring.write().expect("ring lock poisoned") = Arc::new(Vec::new());
        info!(hash = %self.info.hash, "ring cleared");
    }

    /// Rebuild the ring from the sibling table and swap it in.
    ///
    /// Called with the sibling write lock held so rebuilds are serialized.
    fn publish_ring(&self, siblings: &BTreeMap<RingHash, NodeInfo>) {
        let mut ring: Vec<RingHash> = siblings.keys().copied().collect();
        let at = ring.partition_point(|h| *h < self.info.hash);
        ring.insert(at, self.info.hash);

        debug!(size = ring.len(), "ring rebuilt");
        *self.ring.write().expect("ring lock poisoned") = Arc::new(ring);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Current ring snapshot (sorted ascending).
    pub fn ring(&self) -> Arc<Vec<RingHash>> {
        self.ring.read().expect("ring lock poisoned").clone()
    }

    /// Resolve which node owns `query`.
    ///
    /// Picks the smallest ring position `>= query`, wrapping to the smallest
    /// position when `query` is past the end. An empty ring resolves to the
    /// local node.
    pub fn find_node(&self, query: RingHash) -> Owner {
        let ring = self.ring();
        let Some(resolved) = successor(&ring, query) else {
            return Owner::Local;
        };

        if resolved == self.info.hash {
            return Owner::Local;
        }

        match self.sibling(resolved) {
            Some(info) => Owner::Sibling(info),
            // The table was cleared between the snapshot and this read.
            None => Owner::Local,
        }
    }

    // ------------------------------------------------------------------
    // Local shards
    // ------------------------------------------------------------------

    /// Number of local shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the local shard responsible for `data_hash`.
    pub fn shard_index(&self, data_hash: RingHash) -> usize {
        data_hash.value() as usize % self.shards.len()
    }

    /// The local shard responsible for `data_hash`.
    pub fn select_shard(&self, data_hash: RingHash) -> &Arc<dyn ShardStore> {
        &self.shards[self.shard_index(data_hash)]
    }

    /// Total chunks held across all local shards.
    pub fn chunk_count(&self) -> usize {
        self.shards.iter().map(|s| s.count()).sum()
    }
}

/// Smallest entry of a sorted ring that is `>= query`, wrapping to the first.
fn successor(ring: &[RingHash], query: RingHash) -> Option<RingHash> {
    let first = *ring.first()?;
    let idx = ring.partition_point(|h| *h < query);
    Some(ring.get(idx).copied().unwrap_or(first))
}

impl fmt::Debug for PhysicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalNode")
            .field("hash", &self.info.hash)
            .field("addr", &self.info.addr)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}
