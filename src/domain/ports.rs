//! Domain Ports (Port/Adapter Pattern)
//!
//! The replay engine talks to a cache backend only through the [`Client`]
//! port. Adapters (in-memory store, key/value stores, object storage) live
//! outside the engine and implement this trait.
//!
//! ```text
//! ┌───────────────────┐        ┌──────────────────────────┐
//! │  ReplayScheduler  │──────▶ │  Client (port)           │
//! │  perform GET/SET  │        │  set / get / close       │
//! └───────────────────┘        └────────────┬─────────────┘
//!                                           │
//!                              ┌────────────┴─────────────┐
//!                              │ InMemoryClient │ ...      │
//!                              └──────────────────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;

// =============================================================================
// Request Options
// =============================================================================

/// Diagnostic tag attached to a SET
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    /// First write of an object
    Normal,
    /// Rewrite after a simulated miss
    Reset,
}

impl std::fmt::Display for RequestTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestTag::Normal => write!(f, "Normal"),
            RequestTag::Reset => write!(f, "Reset"),
        }
    }
}

/// Options for [`Client::set`]
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Dry-run marker: `Some(cluster_size)` asks the backend to choose a
    /// placement over that many slots without performing any I/O.
    pub dry_run: Option<usize>,
    /// Number of shards (data + parity) to place
    pub shards: usize,
    /// Diagnostic tag
    pub tag: RequestTag,
}

/// Options for [`Client::get`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Dry-run marker, see [`SetOptions::dry_run`]
    pub dry_run: Option<usize>,
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a SET
#[derive(Debug, Clone)]
pub struct SetOutcome {
    pub request_id: String,
    pub success: bool,
    /// Slot index chosen for each shard, in shard order
    pub placement: Vec<usize>,
}

/// Result of a GET
#[derive(Debug, Clone)]
pub struct GetOutcome {
    pub request_id: String,
    /// Object body when the backend returned one
    pub data: Option<Bytes>,
    pub success: bool,
}

// =============================================================================
// Client Port
// =============================================================================

/// Backend capability required by the replay engine.
///
/// Failures are reported through `success` rather than errors: on GET a
/// failure is a cache miss, on SET the record is abandoned.
#[async_trait]
pub trait Client: Send + Sync {
    /// Store `value` (absent in lean mode) and report the chosen placement.
    async fn set(&self, key: &str, value: Option<Bytes>, opts: &SetOptions) -> SetOutcome;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str, opts: &GetOptions) -> GetOutcome;

    /// Release backend resources.
    async fn close(&self);
}
