//! `ringletd`: the ringlet daemon.
//!
//! Binary entrypoint that runs a ringlet node: a chunk store that joins a
//! consistent-hashing cluster through its seed addresses.
//!
//! # Usage
//!
//! ```text
//! ringletd start                                  # start a node on 0.0.0.0:4870
//! ringletd start -c ringlet.toml                  # start with a config file
//! ringletd start -l 127.0.0.1:4871 --seed 127.0.0.1:4870
//! ringletd hash 10.0.0.1:4870                     # ring position of a node
//! ringletd hash --label user:42                   # ring position of a chunk
//! ringletd benchmark -n 200 -s 65536              # write/read benchmark
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ringlet_engine::{Controller, ControllerConfig};
use ringlet_types::{Chunk, NodeAddr, RingHash, hash_chunk};
use tracing::{info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ringletd", version, about = "ringlet chunk-storage daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "RINGLET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node.
    Start {
        /// Override listen address (e.g. "127.0.0.1:4871").
        #[arg(short, long)]
        listen: Option<String>,

        /// Address announced to peers, if different from the bound one.
        #[arg(short, long)]
        advertise: Option<String>,

        /// Seed node(s) to discover (`host:port`). Can be repeated.
        #[arg(short, long)]
        seed: Vec<String>,

        /// Number of local shards.
        #[arg(long)]
        shards: Option<usize>,
    },

    /// Print the ring position of a node address or a chunk label.
    Hash {
        /// Node address (`host:port`).
        #[arg(required_unless_present = "label", conflicts_with = "label")]
        addr: Option<String>,

        /// Chunk label.
        #[arg(long)]
        label: Option<String>,
    },

    /// Run a quick in-memory write/read benchmark through the public API.
    Benchmark {
        /// Number of chunks to write and read.
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// Size of each chunk in bytes.
        #[arg(short, long, default_value = "10240")]
        size: usize,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Start {
            listen,
            advertise,
            seed,
            shards,
        } => {
            // CLI args override config file values.
            if let Some(addr) = listen {
                config.node.listen_addr = addr;
            }
            if let Some(addr) = advertise {
                config.node.advertise_addr = Some(addr);
            }
            if !seed.is_empty() {
                config.cluster.seeds = seed;
            }
            if let Some(k) = shards {
                config.node.shards = k;
            }
            telemetry::init(&config.log.level);
            cmd_start(config).await
        }
        Commands::Hash { addr, label } => {
            println!("{}", hash_line(addr.as_deref(), label.as_deref())?);
            Ok(())
        }
        Commands::Benchmark { count, size } => cmd_benchmark(&config, count, size).await,
    }
}

// -----------------------------------------------------------------------
// ringletd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    let controller_config = config.controller_config()?;
    info!(
        listen = %controller_config.listen_addr,
        shards = controller_config.shard_count,
        seeds = controller_config.seeds.len(),
        "starting ringletd"
    );

    let controller = Controller::new(controller_config);
    controller
        .startup()
        .await
        .context("failed to start controller")?;

    let status_every = Duration::from_secs(config.cluster.status_interval_secs);
    wait_for_shutdown(&controller, status_every).await;

    info!("shutting down");
    controller.shutdown().await;
    Ok(())
}

/// Log periodic status until Ctrl-C.
async fn wait_for_shutdown(controller: &Arc<Controller>, status_every: Duration) {
    if status_every.is_zero() {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "failed to listen for ctrl-c");
        }
        return;
    }

    let mut ticker = tokio::time::interval(status_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = controller.stats();
                info!(
                    siblings = stats.siblings,
                    ring = stats.ring_size,
                    connectors = stats.connectors,
                    chunks = stats.chunks,
                    waiting = stats.monitors,
                    "status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(%e, "failed to listen for ctrl-c");
                }
                return;
            }
        }
    }
}

// -----------------------------------------------------------------------
// ringletd hash
// -----------------------------------------------------------------------

fn hash_line(addr: Option<&str>, label: Option<&str>) -> Result<String> {
    let (what, hash): (String, RingHash) = match (addr, label) {
        (Some(addr), None) => {
            let addr: NodeAddr = addr
                .parse()
                .with_context(|| format!("invalid address {addr:?}"))?;
            (addr.to_string(), addr.hash())
        }
        (None, Some(label)) => (format!("label {label:?}"), hash_chunk(label)),
        _ => bail!("give either an address or --label"),
    };
    Ok(format!("{what}: {hash} (0x{:08x})", hash.value()))
}

// -----------------------------------------------------------------------
// ringletd benchmark
// -----------------------------------------------------------------------

async fn cmd_benchmark(config: &CliConfig, count: usize, size: usize) -> Result<()> {
    let config = bench_config(config)?;
    let timeout = config.request_timeout;
    let shards = config.shard_count;

    println!("ringlet benchmark");
    println!("  chunks:  {count}");
    println!("  size:    {size} bytes each");
    println!("  shards:  {shards}");
    println!("  timeout: {}ms", timeout.as_millis());
    println!();

    // Single node on loopback: measures the local data path.
    let controller = Controller::new(config);
    controller
        .startup()
        .await
        .context("failed to start benchmark node")?;

    let data = generate_bench_data(size);
    let total_bytes = count as u64 * size as u64;

    // --- Write ---
    print!("Writing {count} chunks... ");
    let start = Instant::now();
    for i in 0..count {
        let chunk = Chunk::new(format!("bench-{i}"), &data);
        if !controller.write_chunk(chunk, timeout).await {
            bail!("write of bench-{i} failed");
        }
    }
    let write_dur = start.elapsed();
    let write_mbs = total_bytes as f64 / write_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({write_mbs:.1} MB/s)", write_dur.as_secs_f64());

    // --- Read ---
    print!("Reading {count} chunks... ");
    let start = Instant::now();
    for i in 0..count {
        if controller
            .read_chunk(&format!("bench-{i}"), timeout)
            .await
            .is_none()
        {
            bail!("read of bench-{i} failed");
        }
    }
    let read_dur = start.elapsed();
    let read_mbs = total_bytes as f64 / read_dur.as_secs_f64() / 1_048_576.0;
    println!("{:.2}s ({read_mbs:.1} MB/s)", read_dur.as_secs_f64());

    controller.shutdown().await;

    println!();
    println!("Summary:");
    println!("  Write throughput: {write_mbs:.1} MB/s");
    println!("  Read throughput:  {read_mbs:.1} MB/s");
    println!(
        "  Total data:       {:.1} MB",
        total_bytes as f64 / 1_048_576.0
    );

    Ok(())
}

/// The configured node, moved to an ephemeral loopback port with no seeds.
fn bench_config(config: &CliConfig) -> Result<ControllerConfig> {
    Ok(ControllerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        advertise_addr: None,
        seeds: Vec::new(),
        ..config.controller_config()?
    })
}

/// Generate deterministic test data for benchmarking.
fn generate_bench_data(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
