//! Shared test utilities for ringlet-engine tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ringlet_net::{Protocol, ProtocolHandler, Session};
use ringlet_types::{NodeAddr, RingHash, hash_chunk};

use crate::{Controller, ControllerConfig};

/// Budget for remote calls that are expected to succeed.
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// Start a controller with the given configuration.
pub async fn started(config: ControllerConfig) -> Arc<Controller> {
    let controller = Controller::new(config);
    controller.startup().await.unwrap();
    controller
}

/// A running controller with no seeds and no siblings.
pub async fn single_node() -> Arc<Controller> {
    started(ControllerConfig::test_config()).await
}

/// Address a controller advertises.
pub fn addr_of(controller: &Controller) -> NodeAddr {
    controller.root().unwrap().addr().clone()
}

/// Ring position of a controller.
pub fn hash_of(controller: &Controller) -> RingHash {
    controller.root().unwrap().hash()
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Start `n` controllers that all know each other.
pub async fn cluster(n: usize) -> Vec<Arc<Controller>> {
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(single_node().await);
    }

    let addrs: Vec<NodeAddr> = nodes.iter().map(|c| addr_of(c)).collect();
    for node in &nodes {
        node.add_cluster_address(addrs.iter().cloned());
        node.discover_now().unwrap();
    }
    for node in &nodes {
        wait_until("full membership", || node.stats().siblings == n - 1).await;
    }
    nodes
}

/// Index of the node owning `label`, computed independently of the ring
/// code: the smallest node hash >= the label hash, wrapping to the minimum.
pub fn owner_index(nodes: &[Arc<Controller>], label: &str) -> usize {
    let hash = hash_chunk(label);
    let mut positions: Vec<(RingHash, usize)> = nodes
        .iter()
        .enumerate()
        .map(|(i, c)| (hash_of(c), i))
        .collect();
    positions.sort();
    positions
        .iter()
        .find(|(h, _)| *h >= hash)
        .unwrap_or(&positions[0])
        .1
}

/// First `prefix:N` label owned by `nodes[owner]`.
pub fn label_owned_by(nodes: &[Arc<Controller>], owner: usize, prefix: &str) -> String {
    (0..100_000)
        .map(|i| format!("{prefix}:{i}"))
        .find(|label| owner_index(nodes, label) == owner)
        .expect("no label maps to the requested owner")
}

/// Accepts connections and never answers.
pub struct SilentPeer;

#[async_trait]
impl ProtocolHandler for SilentPeer {
    async fn handle(&self, _session: &Session, _protocol: Protocol) {}
}
