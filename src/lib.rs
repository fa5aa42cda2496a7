//! ecplayback - Trace Replay for Erasure-Coded Serverless Caches
//!
//! Replays a captured access trace against a model of proxies, each owning a
//! pool of ephemeral lambda slots that host erasure-coded chunks. The model
//! tracks placement, memory occupancy, eviction and access frequency without
//! a live cluster, and can drive a real backend through the [`Client`] port.
//!
//! # Architecture
//!
//! ```text
//! trace ──▶ ReplayScheduler ──▶ ConsistentRing ──▶ Proxy ──▶ LambdaSlots
//!                │                                   │
//!                ├── ConcurrencyGate                 └── Balancer
//!                ├── ResourcePool<Client>
//!                └── Checkpoint
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Client port implementations
//! - [`checkpoint`] - Resumable log of processed records
//! - [`domain`] - Trace records and the backend port
//! - [`ec`] - Reed-Solomon codec for stored values
//! - [`error`] - Error types
//! - [`pool`] - Bounded blocking resource pool
//! - [`proxy`] - Placement engine, slots and balancers
//! - [`replay`] - Trace reading, pacing and dispatch
//! - [`ring`] - Bounded-load consistent hashing

pub mod adapters;
pub mod checkpoint;
pub mod domain;
pub mod ec;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod replay;
pub mod ring;

// Re-export commonly used types
pub use checkpoint::Checkpoint;
pub use domain::{Client, TraceRecord};
pub use error::{Error, Result};
pub use proxy::{BalancerKind, Proxy, ProxyConfig};
pub use replay::{ReplayConfig, ReplayScheduler, RunSummary};
pub use ring::{ConsistentRing, RingConfig};
