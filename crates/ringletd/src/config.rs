//! TOML configuration for the ringlet daemon.
//!
//! Every section and field is optional. Command-line flags override what
//! the file says.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use ringlet_engine::{ControllerConfig, DEFAULT_PORT};
use ringlet_types::NodeAddr;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Listen address, advertised address and shards.
    pub node: NodeSection,
    /// Seeds and discovery timing.
    pub cluster: ClusterSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address the listener binds.
    pub listen_addr: String,
    /// Address announced to peers (`host:port`). Defaults to the bound
    /// address.
    pub advertise_addr: Option<String>,
    /// Number of local shards.
    pub shards: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            advertise_addr: None,
            shards: 16,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Addresses (`host:port`) contacted by discovery.
    pub seeds: Vec<String>,
    /// Seconds before the first discovery sweep.
    pub discovery_initial_delay_secs: u64,
    /// Seconds between discovery sweeps.
    pub discovery_interval_secs: u64,
    /// Budget for a remote read or write, in milliseconds.
    pub request_timeout_ms: u64,
    /// Seconds between status log lines. 0 disables them.
    pub status_interval_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            discovery_initial_delay_secs: 5,
            discovery_interval_secs: 180,
            request_timeout_ms: 5_000,
            status_interval_secs: 60,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)
                    .with_context(|| format!("failed to parse {}", p.display()))?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Build the controller configuration, validating addresses.
    pub fn controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let advertise_addr = self
            .node
            .advertise_addr
            .as_deref()
            .map(|a| {
                a.parse::<NodeAddr>()
                    .with_context(|| format!("invalid advertise address {a:?}"))
            })
            .transpose()?;

        let seeds = self
            .cluster
            .seeds
            .iter()
            .map(|s| {
                s.parse::<NodeAddr>()
                    .with_context(|| format!("invalid seed address {s:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ControllerConfig {
            listen_addr: self.node.listen_addr.clone(),
            advertise_addr,
            shard_count: self.node.shards,
            seeds,
            discovery_initial_delay: Duration::from_secs(self.cluster.discovery_initial_delay_secs),
            discovery_interval: Duration::from_secs(self.cluster.discovery_interval_secs.max(1)),
            request_timeout: self.request_timeout(),
        })
    }

    /// Effective request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }
}
