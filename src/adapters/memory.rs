//! In-Memory Client Adapter
//!
//! Implements the [`Client`] port against a process-local store shared by
//! every client handle built from the same [`MemoryStore`].
//!
//! - **Dry run**: SET only chooses a random placement; GET always succeeds
//!   without data. Nothing is stored.
//! - **Stored**: SET Reed-Solomon encodes the value and keeps the shards;
//!   GET reconstructs it. Keys never set, or removed with
//!   [`MemoryStore::evict`], are misses.
//!
//! An optional bandwidth (bytes/second) delays every stored request by
//! `size / bandwidth`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::domain::ports::{Client, GetOptions, GetOutcome, SetOptions, SetOutcome};
use crate::ec::ShardCodec;
use crate::error::Result;

/// In-memory adapter configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Slots to place shards over outside dry-run
    pub cluster_size: usize,
    /// Data shards per object
    pub data_shards: usize,
    /// Parity shards per object
    pub parity_shards: usize,
    /// Simulated bandwidth in bytes/second, 0 for unlimited
    pub bandwidth: u64,
    /// Maximum concurrent encode/decode operations
    pub io_concurrency: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cluster_size: 300,
            data_shards: 4,
            parity_shards: 2,
            bandwidth: 0,
            io_concurrency: 32,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    len: usize,
    /// `None` when the value was set without a body
    shards: Option<Vec<Option<Vec<u8>>>>,
}

/// Object table shared between client handles
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Drop `key`, so the next GET misses. Returns whether it was present.
    pub fn evict(&self, key: &str) -> bool {
        self.objects.remove(key).is_some()
    }

    /// Lose one stored shard of `key`. Returns whether a shard was dropped.
    pub fn lose_shard(&self, key: &str, shard: usize) -> bool {
        self.objects
            .get_mut(key)
            .and_then(|mut obj| {
                obj.shards
                    .as_mut()
                    .and_then(|shards| shards.get_mut(shard))
                    .and_then(Option::take)
            })
            .is_some()
    }

    pub fn clear(&self) {
        self.objects.clear();
    }
}

/// Client handle over a [`MemoryStore`]
pub struct InMemoryClient {
    config: MemoryConfig,
    store: Arc<MemoryStore>,
    codec: Arc<ShardCodec>,
    io: Arc<Semaphore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("config", &self.config)
            .field("objects", &self.store.len())
            .finish()
    }
}

impl InMemoryClient {
    pub fn new(config: MemoryConfig, store: Arc<MemoryStore>) -> Result<Self> {
        let codec = Arc::new(ShardCodec::new(config.data_shards, config.parity_shards)?);
        let io = Arc::new(Semaphore::new(config.io_concurrency.max(1)));
        Ok(Self::with_shared(config, store, codec, io))
    }

    /// Build a handle sharing codec and I/O limit with other handles.
    pub(crate) fn with_shared(
        config: MemoryConfig,
        store: Arc<MemoryStore>,
        codec: Arc<ShardCodec>,
        io: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            store,
            codec,
            io,
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    fn transfer_time(&self, len: usize) -> Duration {
        if self.config.bandwidth == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(len as f64 / self.config.bandwidth as f64)
    }

    async fn throttle(&self, len: usize) {
        let delay = self.transfer_time(len);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn failed_set(request_id: String) -> SetOutcome {
        SetOutcome {
            request_id,
            success: false,
            placement: Vec::new(),
        }
    }
}

/// Pick `shards` distinct slots out of `cluster`, or `None` if impossible.
fn random_placement(cluster: usize, shards: usize) -> Option<Vec<usize>> {
    if shards > cluster {
        return None;
    }
    let mut rng = rand::thread_rng();
    Some(rand::seq::index::sample(&mut rng, cluster, shards).into_vec())
}

#[async_trait]
impl Client for InMemoryClient {
    async fn set(&self, key: &str, value: Option<Bytes>, opts: &SetOptions) -> SetOutcome {
        let request_id = Uuid::new_v4().to_string();
        let cluster = opts.dry_run.unwrap_or(self.config.cluster_size);
        let Some(placement) = random_placement(cluster, opts.shards) else {
            warn!(
                "Cannot place {} shards of {} over {} slots",
                opts.shards, key, cluster
            );
            return Self::failed_set(request_id);
        };
        if opts.dry_run.is_some() {
            return SetOutcome {
                request_id,
                success: true,
                placement,
            };
        }
        if self.closed.load(Ordering::Acquire) {
            return Self::failed_set(request_id);
        }

        let Ok(_permit) = self.io.acquire().await else {
            return Self::failed_set(request_id);
        };
        let len = value.as_ref().map_or(0, Bytes::len);
        let shards = match value {
            Some(value) => match self.codec.encode(&value) {
                Ok(shards) => Some(shards.into_iter().map(Some).collect()),
                Err(e) => {
                    error!("Failed to encode {}: {}", key, e);
                    return Self::failed_set(request_id);
                }
            },
            None => None,
        };
        self.throttle(len).await;
        self.store
            .objects
            .insert(key.to_string(), StoredObject { len, shards });
        debug!("Set {} ({} bytes, {})", key, len, opts.tag);

        SetOutcome {
            request_id,
            success: true,
            placement,
        }
    }

    async fn get(&self, key: &str, opts: &GetOptions) -> GetOutcome {
        let request_id = Uuid::new_v4().to_string();
        let miss = |request_id: String| GetOutcome {
            request_id,
            data: None,
            success: false,
        };
        if opts.dry_run.is_some() {
            return GetOutcome {
                request_id,
                data: None,
                success: true,
            };
        }
        if self.closed.load(Ordering::Acquire) {
            return miss(request_id);
        }

        let Some(stored) = self.store.objects.get(key).map(|o| o.value().clone()) else {
            debug!("Get {}: not found", key);
            return miss(request_id);
        };
        let Ok(_permit) = self.io.acquire().await else {
            return miss(request_id);
        };
        let data = match stored.shards {
            Some(shards) => match self.codec.decode(shards, stored.len) {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) => {
                    warn!("Failed to reconstruct {}: {}", key, e);
                    return miss(request_id);
                }
            },
            None => None,
        };
        self.throttle(stored.len).await;

        GetOutcome {
            request_id,
            data,
            success: true,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================
