//! [`Controller`]: the single orchestration point of a ringlet node.
//!
//! It owns the root [`PhysicalNode`], the inbound listener and one
//! [`Connector`] per sibling it talks to. Reads and writes resolve the
//! owner on the ring and either hit a local shard or block on a remote
//! request. A periodic discovery sweep grows the ring from the configured
//! seeds.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ringlet_net::{
    Connector, ConnectorObserver, Discover, Failure, Listener, ProtocolHandler,
};
use ringlet_placement::{NodeInfo, Owner, PhysicalNode};
use ringlet_types::{Chunk, NodeAddr, RingHash, Status};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::discovery;
use crate::error::EngineError;
use crate::responder::Responder;

/// Point-in-time counters describing a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Whether `startup` has completed and `shutdown` has not run.
    pub running: bool,
    /// Known siblings.
    pub siblings: usize,
    /// Entries on the ring, self included.
    pub ring_size: usize,
    /// Live outbound connectors.
    pub connectors: usize,
    /// Chunks stored in local shards.
    pub chunks: usize,
    /// Callers blocked on a remote response.
    pub monitors: usize,
}

struct Running {
    root: Arc<PhysicalNode>,
    listener: Listener,
    shutdown: watch::Sender<bool>,
    discovery: JoinHandle<()>,
}

/// Ties ring lookup, local storage, remote RPC and discovery together.
pub struct Controller {
    config: ControllerConfig,
    /// Random per-process tag used to recognise our own discovery requests.
    identity: String,
    this: Weak<Controller>,
    running: Mutex<Option<Running>>,
    connectors: Mutex<HashMap<RingHash, Arc<Connector>>>,
    seeds: Mutex<Vec<NodeAddr>>,
    /// Port+1 fallbacks issued during the current sweep.
    fallback_tried: Mutex<HashSet<NodeAddr>>,
    /// Discovery addresses answered by a sibling advertising another address.
    aliases: Mutex<HashMap<NodeAddr, RingHash>>,
}

impl Controller {
    /// Create a stopped controller.
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        let seeds = config.seeds.clone();
        Arc::new_cyclic(|this| Self {
            config,
            identity: format!("{:016x}", rand::random::<u64>()),
            this: this.clone(),
            running: Mutex::new(None),
            connectors: Mutex::new(HashMap::new()),
            seeds: Mutex::new(seeds),
            fallback_tried: Mutex::new(HashSet::new()),
            aliases: Mutex::new(HashMap::new()),
        })
    }

    /// Ring position of `host:port`.
    pub fn hash_address(host: &str, port: u16) -> RingHash {
        ringlet_types::hash_address(host, port)
    }

    /// Ring position of a chunk label.
    pub fn hash_chunk(label: &str) -> RingHash {
        ringlet_types::hash_chunk(label)
    }

    /// This process's identity tag.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind the listener, create the root node and start the discovery timer.
    pub async fn startup(&self) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyStarted);
        }

        let handler: Arc<dyn ProtocolHandler> = Arc::new(Responder::new(self.this.clone()));
        let listener = Listener::bind(&self.config.listen_addr, handler)
            .await
            .map_err(|source| EngineError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;

        let local_addr = listener.local_addr();
        let advertise = self
            .config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| advertised_addr(local_addr));
        let root = Arc::new(PhysicalNode::new(advertise, self.config.shard_count));

        let mut running = self.running.lock().expect("running lock poisoned");
        if running.is_some() {
            listener.shutdown();
            return Err(EngineError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let discovery = tokio::spawn(discovery::run(
            self.this.clone(),
            self.config.discovery_initial_delay,
            self.config.discovery_interval,
            shutdown_rx,
        ));

        info!(
            %local_addr,
            addr = %root.addr(),
            hash = %root.hash(),
            shards = root.shard_count(),
            identity = %self.identity,
            "controller started"
        );

        *running = Some(Running {
            root,
            listener,
            shutdown,
            discovery,
        });
        Ok(())
    }

    /// Stop discovery, close every connection and clear the ring.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().expect("running lock poisoned").take() else {
            return;
        };

        running.shutdown.send_replace(true);
        running.listener.shutdown();

        let connectors: Vec<Arc<Connector>> = self
            .connectors
            .lock()
            .expect("connectors lock poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connector in &connectors {
            connector.disconnect();
        }

        if let Err(e) = running.discovery.await {
            warn!(%e, "discovery task ended abnormally");
        }

        running.root.clearup();
        info!(
            hash = %running.root.hash(),
            connectors = connectors.len(),
            "controller stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().expect("running lock poisoned").is_some()
    }

    /// The local node, while running.
    pub fn root(&self) -> Option<Arc<PhysicalNode>> {
        self.running
            .lock()
            .expect("running lock poisoned")
            .as_ref()
            .map(|r| r.root.clone())
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        self.running
            .lock()
            .expect("running lock poisoned")
            .as_ref()
            .map(|r| r.listener.local_addr())
            .ok_or(EngineError::NotStarted)
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Store `chunk` on its owner. Returns `false` if the owner rejected it,
    /// was unreachable, or did not answer within `timeout`.
    pub async fn write_chunk(&self, chunk: Chunk, timeout: Duration) -> bool {
        let Some(root) = self.root() else {
            warn!(label = chunk.label(), "write_chunk on a stopped controller");
            return false;
        };

        let hash = chunk.hash();
        match root.find_node(hash) {
            Owner::Local => {
                debug!(label = chunk.label(), %hash, "writing chunk locally");
                root.select_shard(hash).put(chunk);
                true
            }
            Owner::Sibling(owner) => {
                debug!(label = chunk.label(), %hash, owner = %owner.hash, "writing chunk remotely");
                self.connector_for(&owner)
                    .blocking_push(&chunk, timeout)
                    .await
            }
        }
    }

    /// Fetch `label` from its owner. `None` when the chunk is missing, the
    /// owner rejected or was unreachable, or `timeout` expired.
    pub async fn read_chunk(&self, label: &str, timeout: Duration) -> Option<Chunk> {
        let Some(root) = self.root() else {
            warn!(label, "read_chunk on a stopped controller");
            return None;
        };

        let hash = Self::hash_chunk(label);
        match root.find_node(hash) {
            Owner::Local => {
                debug!(label, %hash, "reading chunk locally");
                root.select_shard(hash).get(label)
            }
            Owner::Sibling(owner) => {
                debug!(label, %hash, owner = %owner.hash, "reading chunk remotely");
                self.connector_for(&owner)
                    .blocking_pull(label, timeout)
                    .await
            }
        }
    }

    /// Remove `label` from the local shards, regardless of ownership.
    pub fn delete_chunk_local(&self, label: &str) -> Option<Chunk> {
        let root = self.root()?;
        root.select_shard(Self::hash_chunk(label)).delete(label)
    }

    pub fn stats(&self) -> ControllerStats {
        let Some(root) = self.root() else {
            return ControllerStats::default();
        };
        let connectors = self.connectors.lock().expect("connectors lock poisoned");
        ControllerStats {
            running: true,
            siblings: root.sibling_count(),
            ring_size: root.ring().len(),
            connectors: connectors.len(),
            chunks: root.chunk_count(),
            monitors: connectors.values().map(|c| c.monitor_count()).sum(),
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add seed addresses contacted by every discovery sweep.
    pub fn add_cluster_address(&self, addrs: impl IntoIterator<Item = NodeAddr>) {
        let mut seeds = self.seeds.lock().expect("seeds lock poisoned");
        for addr in addrs {
            if !seeds.contains(&addr) {
                debug!(%addr, "added cluster address");
                seeds.push(addr);
            }
        }
    }

    pub fn seeds(&self) -> Vec<NodeAddr> {
        self.seeds.lock().expect("seeds lock poisoned").clone()
    }

    /// Run one discovery sweep now. Returns the number of requests sent.
    pub fn discover_now(&self) -> Result<usize, EngineError> {
        let root = self.root().ok_or(EngineError::NotStarted)?;
        Ok(self.sweep(&root))
    }

    /// Contact every seed that is neither us nor an already-known sibling.
    pub(crate) fn sweep(&self, root: &PhysicalNode) -> usize {
        self.fallback_tried
            .lock()
            .expect("fallback lock poisoned")
            .clear();

        let sent = self
            .seeds()
            .into_iter()
            .filter(|seed| self.discover_at(root, seed.clone()))
            .count();
        debug!(sent, siblings = root.sibling_count(), "discovery sweep");
        sent
    }

    /// Send a discovery request to `addr`. Returns whether one was sent.
    fn discover_at(&self, root: &PhysicalNode, addr: NodeAddr) -> bool {
        let info = NodeInfo::from_addr(addr);
        if info.hash == root.hash() || info.addr == *root.addr() {
            return false;
        }
        if root.is_sibling(info.hash) || self.alias_is_known(root, &info.addr) {
            return false;
        }
        debug!(addr = %info.addr, hash = %info.hash, "sending discovery request");
        self.connector_for(&info)
            .discover(&self.identity, root.addr().clone(), root.hash())
    }

    /// Whether `addr` was already answered by a sibling still on the ring.
    fn alias_is_known(&self, root: &PhysicalNode, addr: &NodeAddr) -> bool {
        self.aliases
            .lock()
            .expect("aliases lock poisoned")
            .get(addr)
            .is_some_and(|hash| root.is_sibling(*hash))
    }

    /// Get or create the connector for `node`.
    fn connector_for(&self, node: &NodeInfo) -> Arc<Connector> {
        let mut connectors = self.connectors.lock().expect("connectors lock poisoned");
        if let Some(existing) = connectors.get(&node.hash) {
            if existing.state() != ringlet_net::ConnectorState::Closed {
                return existing.clone();
            }
        }
        let observer: Weak<dyn ConnectorObserver> = self.this.clone();
        let connector = Connector::new(node.hash, node.addr.clone(), observer);
        connectors.insert(node.hash, connector.clone());
        debug!(remote = %node.hash, addr = %node.addr, "created connector");
        connector
    }

    /// Remove `connector` from the table if it is still the registered one.
    fn remove_connector(&self, connector: &Arc<Connector>) -> bool {
        let mut connectors = self.connectors.lock().expect("connectors lock poisoned");
        match connectors.get(&connector.remote_hash()) {
            Some(current) if Arc::ptr_eq(current, connector) => {
                connectors.remove(&connector.remote_hash());
                true
            }
            _ => false,
        }
    }

    fn teardown(&self, connector: &Arc<Connector>) {
        connector.disconnect();
        if self.remove_connector(connector) {
            debug!(remote = %connector.remote_hash(), addr = %connector.addr(), "connector removed");
        }
    }

    /// Try the same host on the next port, once per sweep.
    fn try_next_port(&self, rejected: &NodeAddr) {
        let Some(root) = self.root() else {
            return;
        };
        let Some(next) = rejected.next_port() else {
            return;
        };
        {
            let mut tried = self.fallback_tried.lock().expect("fallback lock poisoned");
            if tried.contains(rejected) || !tried.insert(next.clone()) {
                return;
            }
        }
        info!(%rejected, fallback = %next, "discovery rejected, trying next port");
        self.discover_at(&root, next);
    }
}

#[async_trait]
impl ConnectorObserver for Controller {
    async fn discover_response(&self, connector: &Arc<Connector>, response: Discover) {
        let Some(root) = self.root() else {
            return;
        };

        match response.status {
            Some(Status::Success) => {
                let sibling = NodeInfo {
                    hash: response.hash,
                    addr: response.addr,
                };
                if root.add_sibling(sibling.clone()) {
                    info!(
                        hash = %sibling.hash,
                        addr = %sibling.addr,
                        identity = %response.identity,
                        "discovered sibling"
                    );
                }
                // Data traffic goes through the connector keyed by the
                // advertised hash; the one keyed by the seed address is spare.
                if sibling.hash != connector.remote_hash() {
                    debug!(seed = %connector.addr(), advertised = %sibling.addr, "seed is an alias");
                    self.aliases
                        .lock()
                        .expect("aliases lock poisoned")
                        .insert(connector.addr().clone(), sibling.hash);
                    self.teardown(connector);
                }
            }
            Some(Status::Reject) => {
                debug!(addr = %connector.addr(), "discovery rejected");
                self.teardown(connector);
                self.try_next_port(connector.addr());
            }
            status => {
                warn!(addr = %connector.addr(), ?status, "discovery failed");
                self.teardown(connector);
            }
        }
    }

    async fn connector_failed(&self, connector: &Arc<Connector>, failure: Failure) {
        warn!(
            remote = %failure.remote,
            addr = %failure.addr,
            reason = %failure.reason,
            original = failure.original.as_ref().map(|p| p.kind()).unwrap_or("none"),
            "request failed"
        );
        if self.remove_connector(connector) {
            debug!(remote = %connector.remote_hash(), "connector removed after failure");
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.identity)
            .field("listen_addr", &self.config.listen_addr)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// The address peers should use for a listener bound to `local`.
fn advertised_addr(local: SocketAddr) -> NodeAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    NodeAddr::from(SocketAddr::new(ip, local.port()))
}
