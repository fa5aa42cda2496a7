//! Infrastructure Adapters
//!
//! Implementations of the [`Client`] port, following the Port/Adapter
//! (Hexagonal) pattern. The replay engine never names a concrete adapter; it
//! receives a [`ClientProvider`] and pools the handles it builds.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Domain: Client port (set / get / close)      │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │ Adapters: InMemoryClient over MemoryStore    │
//! └──────────────────────────────────────────────┘
//! ```

mod memory;

pub use memory::{InMemoryClient, MemoryConfig, MemoryStore};

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use crate::domain::ports::Client;
use crate::ec::ShardCodec;
use crate::error::Result;
use crate::pool::Constructor;

/// Factory for backend client handles
pub type ClientProvider = Constructor<Arc<dyn Client>>;

/// Provider of in-memory client handles sharing `store`, one codec and one
/// I/O limit.
pub fn memory_provider(config: MemoryConfig, store: Arc<MemoryStore>) -> Result<ClientProvider> {
    let codec = Arc::new(ShardCodec::new(config.data_shards, config.parity_shards)?);
    let io = Arc::new(Semaphore::new(config.io_concurrency.max(1)));
    info!(
        "Preparing in-memory client with bandwidth {} B/s",
        config.bandwidth
    );
    Ok(Box::new(move || {
        Arc::new(InMemoryClient::with_shared(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&io),
        )) as Arc<dyn Client>
    }))
}
