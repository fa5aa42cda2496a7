//! Trace Replay
//!
//! Reads a trace in file order, reproduces its inter-arrival timing, and
//! dispatches every record as a concurrent GET/SET simulation against the
//! proxy model and a backend [`Client`](crate::domain::Client).
//!
//! ```text
//!  TraceReader ──record──▶ timing wait ──▶ ConcurrencyGate ──spawn──▶ perform
//!       │                                        │                     │
//!   skip / seen ──fold wait into skipped         │        ring ▶ proxy ▶ slots
//!                                                ▼                     │
//!                                         barrier (wait all) ◀─────────┘
//!                                                │
//!                                           RunSummary
//! ```
//!
//! # Components
//!
//! - **Trace** (`trace.rs`): row parsing and size transforms
//! - **Gate** (`gate.rs`): in-flight limit, high-water mark, end-of-run barrier
//! - **Perform** (`perform.rs`): the per-record SET / GET / reset simulation
//! - **Scheduler** (`scheduler.rs`): pacing and dispatch
//! - **Summary** (`summary.rs`): end-of-run aggregates

mod gate;
mod perform;
mod scheduler;
mod summary;
mod trace;

pub use gate::{ConcurrencyGate, GatePermit};
pub use perform::{perform, Operation, PerformContext, PerformOutcome};
pub use scheduler::ReplayScheduler;
pub use summary::{format_bytes, write_timings, RunSummary, TimingEntry};
pub use trace::{parse_row, SizeTransform, TraceReader, TraceRow, TIME_PATTERN, TIME_PATTERN_SHORT};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::proxy::{BalancerKind, ProxyConfig};
use crate::ring::RingConfig;

/// Default `maxsz`: 2 GiB
pub const DEFAULT_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Default `scalefrom`: 100 MiB
pub const DEFAULT_SCALE_FROM: u64 = 100 * 1024 * 1024;

/// Replay configuration
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// One proxy per address
    pub addresses: Vec<String>,
    /// Lambda slots per proxy
    pub cluster_size: usize,
    /// Data shards per object
    pub data_shards: usize,
    /// Parity shards per object
    pub parity_shards: usize,
    /// In-flight record limit, 0 for unlimited
    pub concurrency: usize,
    /// Records to read without dispatching
    pub skip: u64,
    /// Pace with `min(interval, gap to previous record)` instead of absolute time
    pub compact: bool,
    /// Upper bound on the compact-mode wait
    pub interval: Duration,
    /// Ask the backend for placements only, without I/O
    pub dry_run: bool,
    /// Do not materialize object values
    pub lean: bool,
    /// Object sizes are clamped to this
    pub max_size: u64,
    /// Objects larger than this are scaled
    pub scale_from: u64,
    /// Scale factor for large objects
    pub scale_factor: f64,
    /// Enable the balancer
    pub balance: bool,
    /// Balancer used when `balance` is set
    pub balancer: BalancerKind,
    /// Memory bound per slot in bytes, 0 for unlimited
    pub slot_capacity: u64,
    /// Cap pooled client handles at `concurrency` instead of growing on demand
    pub strict_client_pool: bool,
    /// Resumable checkpoint log
    pub checkpoint: Option<PathBuf>,
    /// Per-request timing CSV written at the end of the run
    pub timing_file: Option<PathBuf>,
    /// Consistent ring parameters
    pub ring: RingConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:6378".to_string()],
            cluster_size: 300,
            data_shards: 4,
            parity_shards: 2,
            concurrency: 0,
            skip: 0,
            compact: false,
            interval: Duration::from_millis(2000),
            dry_run: false,
            lean: false,
            max_size: DEFAULT_MAX_SIZE,
            scale_from: DEFAULT_SCALE_FROM,
            scale_factor: 1.0,
            balance: false,
            balancer: BalancerKind::Priority,
            slot_capacity: 0,
            strict_client_pool: false,
            checkpoint: None,
            timing_file: None,
            ring: RingConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(Error::Config("address list is empty".into()));
        }
        if self.data_shards == 0 {
            return Err(Error::Config("data shard count must be positive".into()));
        }
        if self.cluster_size < self.shard_count() {
            return Err(Error::Config(format!(
                "cluster size {} is smaller than {} shards per object",
                self.cluster_size,
                self.shard_count()
            )));
        }
        if !(self.scale_factor.is_finite() && self.scale_factor > 0.0) {
            return Err(Error::Config(format!(
                "scale factor must be positive, got {}",
                self.scale_factor
            )));
        }
        if self.strict_client_pool && self.concurrency == 0 {
            return Err(Error::Config(
                "strict client pool needs a concurrency limit".into(),
            ));
        }
        Ok(())
    }

    /// Shards per object (data + parity)
    pub fn shard_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Balancer in effect
    pub fn effective_balancer(&self) -> BalancerKind {
        if self.balance {
            self.balancer
        } else {
            BalancerKind::None
        }
    }

    /// Whether committed chunks are fed back to the balancer
    pub fn learns_placement(&self) -> bool {
        self.dry_run && self.balance
    }

    /// Size transforms applied to every parsed row
    pub fn size_transform(&self) -> SizeTransform {
        SizeTransform {
            max_size: self.max_size,
            scale_from: self.scale_from,
            scale_factor: self.scale_factor,
            data_shards: self.data_shards,
        }
    }

    /// Per-proxy configuration
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            cluster_size: self.cluster_size,
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
            slot_capacity: self.slot_capacity,
            balancer: self.effective_balancer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReplayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.shard_count(), 6);
        assert_eq!(config.effective_balancer(), BalancerKind::None);
    }

    #[test]
    fn test_invalid_configs() {
        let small = ReplayConfig {
            cluster_size: 5,
            ..ReplayConfig::default()
        };
        assert!(small.validate().is_err());

        let no_data = ReplayConfig {
            data_shards: 0,
            ..ReplayConfig::default()
        };
        assert!(no_data.validate().is_err());

        let strict_unbounded = ReplayConfig {
            strict_client_pool: true,
            ..ReplayConfig::default()
        };
        assert!(strict_unbounded.validate().is_err());

        let negative_scale = ReplayConfig {
            scale_factor: -1.0,
            ..ReplayConfig::default()
        };
        assert!(negative_scale.validate().is_err());
    }

    #[test]
    fn test_balance_switch() {
        let config = ReplayConfig {
            balance: true,
            balancer: BalancerKind::Weighted,
            ..ReplayConfig::default()
        };
        assert_eq!(config.effective_balancer(), BalancerKind::Weighted);
        assert!(!config.learns_placement());
        assert_eq!(config.proxy_config().balancer, BalancerKind::Weighted);
    }
}
