//! Single-node lifecycle and read/write tests.

use ringlet_types::{Chunk, hash_address, hash_chunk};

use crate::{Controller, ControllerConfig, EngineError};

use super::helpers::{TIMEOUT, single_node, test_data};

// -----------------------------------------------------------------------
// Round trips
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_single_node_write_read() {
    let node = single_node().await;
    let chunk = Chunk::new("user:42", &test_data(5000));

    assert!(node.write_chunk(chunk.clone(), TIMEOUT).await);
    let got = node.read_chunk("user:42", TIMEOUT).await.unwrap();
    assert_eq!(got.label(), chunk.label());
    assert_eq!(got.data(), chunk.data());

    let stats = node.stats();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.siblings, 0);
    assert_eq!(stats.ring_size, 1);
    assert_eq!(stats.connectors, 0);
}

#[tokio::test]
async fn test_read_missing_label() {
    let node = single_node().await;
    assert!(node.read_chunk("nope", TIMEOUT).await.is_none());
}

#[tokio::test]
async fn test_overwrite_replaces_data() {
    let node = single_node().await;
    assert!(node.write_chunk(Chunk::new("k", b"first"), TIMEOUT).await);
    assert!(node.write_chunk(Chunk::new("k", b"second"), TIMEOUT).await);

    let got = node.read_chunk("k", TIMEOUT).await.unwrap();
    assert_eq!(got.data().as_ref(), b"second");
    assert_eq!(node.stats().chunks, 1);
}

#[tokio::test]
async fn test_empty_chunk() {
    let node = single_node().await;
    assert!(node.write_chunk(Chunk::new("empty", b""), TIMEOUT).await);
    let got = node.read_chunk("empty", TIMEOUT).await.unwrap();
    assert!(got.is_empty());
}

#[tokio::test]
async fn test_many_labels_spread_over_shards() {
    let node = single_node().await;
    for i in 0..200 {
        let label = format!("chunk-{i}");
        assert!(node.write_chunk(Chunk::new(label, &test_data(64 + i)), TIMEOUT).await);
    }
    assert_eq!(node.stats().chunks, 200);

    let root = node.root().unwrap();
    let shards = root.shard_count();
    for i in 0..200 {
        let label = format!("chunk-{i}");
        let index = root.shard_index(hash_chunk(&label));
        assert!(index < shards);
        assert!(root.select_shard(hash_chunk(&label)).get(&label).is_some());
    }
}

#[tokio::test]
async fn test_delete_chunk_local() {
    let node = single_node().await;
    assert!(node.write_chunk(Chunk::new("k", b"v"), TIMEOUT).await);

    let removed = node.delete_chunk_local("k").unwrap();
    assert_eq!(removed.data().as_ref(), b"v");
    assert!(node.delete_chunk_local("k").is_none());
    assert!(node.read_chunk("k", TIMEOUT).await.is_none());
}

// -----------------------------------------------------------------------
// Hashing
// -----------------------------------------------------------------------

#[test]
fn test_hash_helpers_are_pure() {
    assert_eq!(
        Controller::hash_address("10.0.0.1", 4870),
        Controller::hash_address("10.0.0.1", 4870)
    );
    assert_eq!(
        Controller::hash_address("10.0.0.1", 4870),
        hash_address("10.0.0.1", 4870)
    );
    assert_ne!(
        Controller::hash_address("10.0.0.1", 4870),
        Controller::hash_address("10.0.0.1", 4871)
    );
    assert_eq!(Controller::hash_chunk("user:42"), hash_chunk("user:42"));
}

#[tokio::test]
async fn test_root_hash_matches_advertised_address() {
    let node = single_node().await;
    let root = node.root().unwrap();
    let local = node.local_addr().unwrap();
    assert_ne!(local.port(), 0);
    assert_eq!(root.addr().port, local.port());
    assert_eq!(root.hash(), hash_address(&root.addr().host, root.addr().port));
}

// -----------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_data_path_before_startup_fails_softly() {
    let node = Controller::new(ControllerConfig::test_config());
    assert!(!node.write_chunk(Chunk::new("k", b"v"), TIMEOUT).await);
    assert!(node.read_chunk("k", TIMEOUT).await.is_none());
}

#[tokio::test]
async fn test_double_startup_is_rejected() {
    let node = single_node().await;
    assert!(matches!(
        node.startup().await,
        Err(EngineError::AlreadyStarted)
    ));
    assert!(node.is_running());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let node = single_node().await;
    let taken = node.local_addr().unwrap();

    let other = Controller::new(ControllerConfig {
        listen_addr: taken.to_string(),
        ..ControllerConfig::test_config()
    });
    let err = other.startup().await.unwrap_err();
    assert!(matches!(err, EngineError::Bind { .. }), "unexpected: {err}");
    assert!(!other.is_running());
}

#[tokio::test]
async fn test_shutdown_clears_state_and_allows_restart() {
    let node = single_node().await;
    assert!(node.write_chunk(Chunk::new("k", b"v"), TIMEOUT).await);
    let root = node.root().unwrap();

    node.shutdown().await;
    assert!(!node.is_running());
    assert!(node.root().is_none());
    assert_eq!(root.ring().len(), 0);
    assert!(!node.write_chunk(Chunk::new("k", b"v"), TIMEOUT).await);

    // Shutting down twice is harmless.
    node.shutdown().await;

    node.startup().await.unwrap();
    assert!(node.read_chunk("k", TIMEOUT).await.is_none());
    assert_eq!(node.stats().ring_size, 1);
}

#[tokio::test]
async fn test_explicit_advertise_address_sets_ring_position() {
    let advertise = ringlet_types::NodeAddr::new("10.9.8.7", 4870);
    let node = Controller::new(ControllerConfig {
        advertise_addr: Some(advertise.clone()),
        ..ControllerConfig::test_config()
    });
    node.startup().await.unwrap();

    let root = node.root().unwrap();
    assert_eq!(*root.addr(), advertise);
    assert_eq!(root.hash(), advertise.hash());
}
