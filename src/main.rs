//! playback
//!
//! Replays a trace file against the simulated cache cluster and prints the
//! run summary.
//!
//! ```text
//! playback [options] tracefile
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ecplayback::adapters::{memory_provider, MemoryConfig, MemoryStore};
use ecplayback::replay::{ReplayConfig, DEFAULT_MAX_SIZE, DEFAULT_SCALE_FROM};
use ecplayback::{BalancerKind, ReplayScheduler};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Trace-driven replay of an erasure-coded serverless cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trace file (CSV with a header row)
    trace: PathBuf,

    /// Proxy addresses, comma separated; one simulated proxy each
    #[arg(long, env = "PLAYBACK_ADDRLIST", default_value = "127.0.0.1:6378")]
    addrlist: String,

    /// Lambda slots per proxy
    #[arg(long, env = "PLAYBACK_CLUSTER", default_value = "300")]
    cluster: usize,

    /// Data shards for RS erasure coding
    #[arg(short = 'd', long = "data-shards", default_value = "4")]
    data_shards: usize,

    /// Parity shards for RS erasure coding
    #[arg(short = 'p', long = "parity-shards", default_value = "2")]
    parity_shards: usize,

    /// Maximum concurrent encode/decode operations in the backend
    #[arg(short = 'g', long = "io-concurrency", default_value = "32")]
    io_concurrency: usize,

    /// Maximum records in flight, 0 for unlimited
    #[arg(short = 'c', long, env = "PLAYBACK_CONCURRENCY", default_value = "0")]
    concurrency: usize,

    /// Skip the first N records
    #[arg(long, default_value = "0")]
    skip: u64,

    /// Replay in compact mode
    #[arg(long)]
    compact: bool,

    /// Maximum wait between records in compact mode (ms)
    #[arg(short = 'i', long, default_value = "2000")]
    interval: u64,

    /// Choose placements only, without backend I/O
    #[arg(long)]
    dryrun: bool,

    /// Do not materialize object values
    #[arg(long)]
    lean: bool,

    /// Maximum object size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE)]
    maxsz: u64,

    /// Objects larger than this many bytes are scaled
    #[arg(long, default_value_t = DEFAULT_SCALE_FROM)]
    scalefrom: u64,

    /// Scale factor for large objects
    #[arg(long, default_value = "1.0")]
    scalesz: f64,

    /// Enable the balancer
    #[arg(long)]
    balance: bool,

    /// Balancer used with --balance (none, lru, priority, weighted)
    #[arg(long, env = "PLAYBACK_BALANCER", default_value = "priority")]
    balancer: BalancerKind,

    /// Memory bound per slot in bytes, 0 for unlimited
    #[arg(long, default_value = "0")]
    slot_capacity: u64,

    /// Cap pooled clients at the concurrency limit
    #[arg(long)]
    strict_client_pool: bool,

    /// Backend bandwidth in bytes/second, 0 for unlimited
    #[arg(long, default_value = "0")]
    bandwidth: u64,

    /// Resumable checkpoint log
    #[arg(long, env = "PLAYBACK_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// Write per-request timings to this CSV file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    summary_json: bool,

    /// Log at info level and above
    #[arg(long)]
    disable_debug: bool,

    /// Log warnings and the summary only
    #[arg(long)]
    summary_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "trace")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            addresses: self
                .addrlist
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect(),
            cluster_size: self.cluster,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            concurrency: self.concurrency,
            skip: self.skip,
            compact: self.compact,
            interval: Duration::from_millis(self.interval),
            dry_run: self.dryrun,
            lean: self.lean,
            max_size: self.maxsz,
            scale_from: self.scalefrom,
            scale_factor: self.scalesz,
            balance: self.balance,
            balancer: self.balancer,
            slot_capacity: self.slot_capacity,
            strict_client_pool: self.strict_client_pool,
            checkpoint: self.checkpoint.clone(),
            timing_file: self.file.clone(),
            ..ReplayConfig::default()
        }
    }

    fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            cluster_size: self.cluster,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            bandwidth: self.bandwidth,
            io_concurrency: self.io_concurrency,
        }
    }

    fn level(&self) -> Level {
        if self.summary_only {
            return Level::WARN;
        }
        if self.disable_debug {
            return Level::INFO;
        }
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = args.replay_config();
    info!("Starting playback of {}", args.trace.display());
    info!("  Proxies: {}", config.addresses.len());
    info!("  Slots per proxy: {}", config.cluster_size);
    info!("  Shards: {}+{}", config.data_shards, config.parity_shards);
    info!("  Dry-run mode: {}", config.dry_run);

    let provider = memory_provider(args.memory_config(), Arc::new(MemoryStore::new()))
        .context("failed to prepare backend client")?;
    let scheduler = ReplayScheduler::new(config, provider)
        .await
        .context("failed to prepare replay")?;
    let summary = scheduler
        .run_file(&args.trace)
        .await
        .with_context(|| format!("failed to replay {}", args.trace.display()))?;

    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::from_default_env().add_directive(args.level().into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_replay_config() {
        let args = Args::parse_from(["playback", "trace.csv"]);
        let config = args.replay_config();
        assert_eq!(config.cluster_size, 300);
        assert_eq!(config.shard_count(), 6);
        assert_eq!(config.interval, Duration::from_millis(2000));
        assert_eq!(config.balancer, BalancerKind::Priority);
        assert!(config.validate().is_ok());
        assert_eq!(args.level(), Level::TRACE);
    }

    #[test]
    fn test_short_flags_and_address_list() {
        let args = Args::parse_from([
            "playback", "-d", "10", "-p", "1", "-c", "8", "--addrlist", "a:1, b:2",
            "--balance", "--balancer", "lru", "--summary-only", "t.csv",
        ]);
        let config = args.replay_config();
        assert_eq!(config.addresses, vec!["a:1", "b:2"]);
        assert_eq!(config.shard_count(), 11);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.effective_balancer(), BalancerKind::Lru);
        assert_eq!(args.level(), Level::WARN);
    }
}
