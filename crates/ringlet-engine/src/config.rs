//! Controller configuration.

use std::time::Duration;

use ringlet_types::NodeAddr;

/// Default port ringlet nodes listen on.
pub const DEFAULT_PORT: u16 = 4870;

/// Configuration for creating a [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the listener binds, e.g. `0.0.0.0:4870`.
    pub listen_addr: String,
    /// Address announced to peers and hashed into our ring position.
    /// Defaults to the bound address, with an unspecified host replaced
    /// by loopback.
    pub advertise_addr: Option<NodeAddr>,
    /// Number of local shards (K).
    pub shard_count: usize,
    /// Addresses contacted by every discovery sweep.
    pub seeds: Vec<NodeAddr>,
    /// Delay before the first discovery sweep.
    pub discovery_initial_delay: Duration,
    /// Period between discovery sweeps.
    pub discovery_interval: Duration,
    /// Time budget for a remote read or write issued by the daemon.
    pub request_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            advertise_addr: None,
            shard_count: 16,
            seeds: Vec::new(),
            discovery_initial_delay: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(180),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Loopback on an ephemeral port, few shards, and a discovery timer
    /// that effectively never fires on its own. Tests drive discovery
    /// through `discover_now`.
    pub fn test_config() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            advertise_addr: None,
            shard_count: 4,
            seeds: Vec::new(),
            discovery_initial_delay: Duration::from_secs(3600),
            discovery_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(2),
        }
    }
}
