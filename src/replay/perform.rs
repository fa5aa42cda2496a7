//! Per-Record Simulation
//!
//! One dispatched trace record against one proxy:
//!
//! - **SET** (key not placed yet): ask the backend for a raw placement, remap
//!   it through the balancer, revive or create each shard's chunk in its
//!   slot, commit the placement.
//! - **GET hit**: count one access on every shard and activate its slot.
//! - **GET miss**: issue a reset SET, remap the new raw placement, then
//!   reconcile shard by shard. The placement is rewritten only when some
//!   shard moved or had to be revived from the evicted table.
//!
//! Reconciliation first checks that every shard can be found, either in its
//! old slot or parked, and only then moves anything, so a missing shard
//! aborts the record with [`Error::Consistency`] and leaves state untouched.

use std::fmt;

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, error, instrument, trace, warn};

use crate::domain::ports::{Client, GetOptions, RequestTag, SetOptions};
use crate::domain::TraceRecord;
use crate::error::{Error, Result};
use crate::proxy::{Chunk, ChunkKey, Proxy};

use super::ReplayConfig;

/// Trace operation inferred from the placement table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => write!(f, "get"),
            Operation::Set => write!(f, "set"),
        }
    }
}

/// What a record did to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformOutcome {
    /// New object placed
    Stored,
    /// Backend SET failed; nothing committed
    SetFailed,
    /// Every shard served
    Hit,
    /// Miss recovered by a reset SET
    Reset {
        /// Whether the placement was rewritten
        displaced: bool,
    },
    /// Miss whose reset SET failed; nothing changed
    ResetFailed,
}

impl PerformOutcome {
    pub fn operation(&self) -> Operation {
        match self {
            PerformOutcome::Stored | PerformOutcome::SetFailed => Operation::Set,
            _ => Operation::Get,
        }
    }
}

/// Options shared by every dispatched record
#[derive(Debug, Clone)]
pub struct PerformContext {
    /// Shards per object
    pub shards: usize,
    /// `Some(cluster_size)` in dry-run
    pub dry_run: Option<usize>,
    /// Skip value generation
    pub lean: bool,
    /// Feed committed chunks to the balancer
    pub learn: bool,
}

impl PerformContext {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            shards: config.shard_count(),
            dry_run: config.dry_run.then_some(config.cluster_size),
            lean: config.lean,
            learn: config.learns_placement(),
        }
    }
}

/// Simulate one record. Returns the backend request id with the outcome.
#[instrument(level = "trace", skip_all, fields(key = %obj.key, proxy = proxy.id()))]
pub async fn perform(
    ctx: &PerformContext,
    client: &dyn Client,
    proxy: &Proxy,
    obj: &TraceRecord,
) -> Result<(String, PerformOutcome)> {
    let _guard = proxy.lock_key(&obj.key).await;
    match proxy.placements(&obj.key) {
        Some(placement) => {
            trace!("Found placements of {}: {:?}", obj.key, placement);
            get(ctx, client, proxy, obj, placement).await
        }
        None => {
            trace!("No placements found: {}", obj.key);
            set(ctx, client, proxy, obj).await
        }
    }
}

async fn set(
    ctx: &PerformContext,
    client: &dyn Client,
    proxy: &Proxy,
    obj: &TraceRecord,
) -> Result<(String, PerformOutcome)> {
    let value = (!ctx.lean).then(|| random_value(obj.size));
    let opts = SetOptions {
        dry_run: ctx.dry_run,
        shards: ctx.shards,
        tag: RequestTag::Normal,
    };
    let out = client.set(&obj.key, value, &opts).await;
    if !out.success {
        warn!("Set {} failed (request {})", obj.key, out.request_id);
        return Ok((out.request_id, PerformOutcome::SetFailed));
    }
    let raw = checked_raw(ctx, obj, "set", out.placement, &out.request_id)?;

    let placement = proxy.remap(&raw, obj);
    proxy.check_placement(&placement)?;
    for (shard, &idx) in placement.iter().enumerate() {
        let key = ChunkKey::new(shard, obj.key.as_str());
        let chunk = proxy
            .get_evicted(&key)
            .unwrap_or_else(|| Chunk::new(key, obj.chunk_size));
        if ctx.learn {
            proxy.adapt(idx, &chunk);
        }
        proxy.add_chunk(idx, chunk)?;
        proxy.activate(idx, obj.timestamp)?;
    }
    trace!("Set {}, placements: {:?}", obj.key, placement);
    proxy.set_placements(&obj.key, placement)?;
    Ok((out.request_id, PerformOutcome::Stored))
}

async fn get(
    ctx: &PerformContext,
    client: &dyn Client,
    proxy: &Proxy,
    obj: &TraceRecord,
    placement: Vec<usize>,
) -> Result<(String, PerformOutcome)> {
    let out = client
        .get(&obj.key, &GetOptions { dry_run: ctx.dry_run })
        .await;
    if out.success && proxy.validate(obj) && record_hit(proxy, obj, &placement)? {
        trace!("Get {}", obj.key);
        return Ok((out.request_id, PerformOutcome::Hit));
    }
    let request_id = out.request_id;

    let value = (!ctx.lean).then(|| random_value(obj.size));
    let opts = SetOptions {
        dry_run: ctx.dry_run,
        shards: ctx.shards,
        tag: RequestTag::Reset,
    };
    let reset = client.set(&obj.key, value, &opts).await;
    if !reset.success {
        warn!("Reset {} failed (request {})", obj.key, reset.request_id);
        return Ok((request_id, PerformOutcome::ResetFailed));
    }
    trace!("Reset {}", obj.key);
    let raw = checked_raw(ctx, obj, "reset", reset.placement, &reset.request_id)?;
    let new_placement = proxy.remap(&raw, obj);
    proxy.check_placement(&new_placement)?;

    let displaced = reconcile(proxy, obj, &placement, &new_placement)?;
    if displaced {
        proxy.set_placements(&obj.key, new_placement)?;
    }
    Ok((request_id, PerformOutcome::Reset { displaced }))
}

/// Count one access on every shard. Returns false if a shard was evicted
/// after validation, in which case the GET is served as a miss.
fn record_hit(proxy: &Proxy, obj: &TraceRecord, placement: &[usize]) -> Result<bool> {
    for (shard, &idx) in placement.iter().enumerate() {
        let key = ChunkKey::new(shard, obj.key.as_str());
        if proxy.update_chunk(idx, &key, |c| c.access_frequency += 1)? {
            proxy.activate(idx, obj.timestamp)?;
            continue;
        }
        if proxy.is_evicted(&key) {
            debug!("Chunk {} evicted from {} during get, resetting", key, idx);
            return Ok(false);
        }
        error!("Unexpected key {} not found in {}", key, idx);
        return Err(Error::Consistency {
            key: obj.key.clone(),
            shard,
            slot: idx,
        });
    }
    Ok(true)
}

/// Where a shard was found before reconciliation
#[derive(Debug, Clone, Copy)]
enum Source {
    Slot(usize),
    Evicted,
}

/// Move every shard to its slot in `new`. Returns whether any shard moved or
/// was revived.
fn reconcile(proxy: &Proxy, obj: &TraceRecord, old: &[usize], new: &[usize]) -> Result<bool> {
    let consistency = |shard: usize, slot: usize| {
        error!(
            "Chunk {}@{} not found in slot {} nor in evicted chunks",
            shard, obj.key, slot
        );
        Error::Consistency {
            key: obj.key.clone(),
            shard,
            slot,
        }
    };

    let mut sources = Vec::with_capacity(old.len());
    for (shard, &slot) in old.iter().enumerate() {
        let key = ChunkKey::new(shard, obj.key.as_str());
        if proxy.get_chunk(slot, &key)?.is_some() {
            sources.push(Source::Slot(slot));
        } else if proxy.is_evicted(&key) {
            sources.push(Source::Evicted);
        } else {
            return Err(consistency(shard, slot));
        }
    }

    let mut displaced = false;
    for (shard, (&idx, source)) in new.iter().zip(sources).enumerate() {
        let key = ChunkKey::new(shard, obj.key.as_str());
        let stays = matches!(source, Source::Slot(slot) if slot == idx);
        if stays && proxy.update_chunk(idx, &key, |c| c.reset_count += 1)? {
            proxy.activate(idx, obj.timestamp)?;
            continue;
        }

        displaced = true;
        let from = match source {
            Source::Slot(slot) => {
                if slot != idx {
                    warn!("Placement changed on reset {}, {} -> {}", key, slot, idx);
                }
                proxy.del_chunk(slot, &key)?
            }
            Source::Evicted => None,
        };
        let mut chunk = from
            .or_else(|| proxy.get_evicted(&key))
            .ok_or_else(|| consistency(shard, old[shard]))?;
        chunk.reset_count += 1;
        proxy.add_chunk(idx, chunk)?;
        proxy.activate(idx, obj.timestamp)?;
    }
    Ok(displaced)
}

/// Reject backend placements of the wrong width.
fn checked_raw(
    ctx: &PerformContext,
    obj: &TraceRecord,
    op: &'static str,
    raw: Vec<usize>,
    request_id: &str,
) -> Result<Vec<usize>> {
    if raw.len() != ctx.shards {
        error!(
            "Backend returned {} slots for {} shards of {}",
            raw.len(),
            ctx.shards,
            obj.key
        );
        return Err(Error::Backend {
            op,
            key: obj.key.clone(),
            request_id: request_id.to_string(),
        });
    }
    Ok(raw)
}

fn random_value(size: u64) -> Bytes {
    let mut value = vec![0u8; size as usize];
    rand::thread_rng().fill_bytes(&mut value);
    Bytes::from(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{GetOutcome, SetOutcome};
    use crate::proxy::ProxyConfig;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend returning scripted placements and GET results
    #[derive(Default)]
    struct ScriptedClient {
        placements: Mutex<VecDeque<Vec<usize>>>,
        get_fails: AtomicBool,
        set_fails: AtomicBool,
    }

    impl ScriptedClient {
        fn with_placements(placements: &[&[usize]]) -> Self {
            let client = Self::default();
            client
                .placements
                .lock()
                .extend(placements.iter().map(|p| p.to_vec()));
            client
        }
    }

    #[async_trait]
    impl Client for ScriptedClient {
        async fn set(&self, _key: &str, _value: Option<Bytes>, _opts: &SetOptions) -> SetOutcome {
            SetOutcome {
                request_id: "set".into(),
                success: !self.set_fails.load(Ordering::SeqCst),
                placement: self.placements.lock().pop_front().unwrap_or_default(),
            }
        }

        async fn get(&self, _key: &str, _opts: &GetOptions) -> GetOutcome {
            GetOutcome {
                request_id: "get".into(),
                data: None,
                success: !self.get_fails.load(Ordering::SeqCst),
            }
        }

        async fn close(&self) {}
    }

    fn ctx() -> PerformContext {
        PerformContext {
            shards: 6,
            dry_run: Some(8),
            lean: true,
            learn: false,
        }
    }

    fn proxy() -> Proxy {
        Proxy::new(
            0,
            ProxyConfig {
                cluster_size: 8,
                ..ProxyConfig::default()
            },
        )
        .unwrap()
    }

    fn record(key: &str, size: u64, minute: u32) -> TraceRecord {
        let ts = NaiveDate::from_ymd_opt(2017, 6, 1)
            .unwrap()
            .and_hms_opt(12, minute, 0)
            .unwrap();
        TraceRecord::new(key, size, 4, ts)
    }

    fn total_mem(p: &Proxy) -> u64 {
        p.slots().iter().map(|s| s.mem_used()).sum()
    }

    fn chunk_at(p: &Proxy, slot: usize, shard: usize, key: &str) -> Chunk {
        p.get_chunk(slot, &ChunkKey::new(shard, key)).unwrap().unwrap()
    }

    const FIRST: &[usize] = &[0, 1, 2, 3, 4, 5];

    #[tokio::test]
    async fn test_set_then_hit() {
        let client = ScriptedClient::with_placements(&[FIRST]);
        let p = proxy();

        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Stored);
        assert_eq!(total_mem(&p), 60);

        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 1)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Hit);
        assert_eq!(outcome.operation(), Operation::Get);
        assert_eq!(total_mem(&p), 60);
        for (shard, &slot) in FIRST.iter().enumerate() {
            assert_eq!(chunk_at(&p, slot, shard, "A").access_frequency, 1);
            assert_eq!(p.slots()[slot].active_minutes(), 2);
        }
        assert_eq!(p.placement_writes(), 1);
    }

    #[tokio::test]
    async fn test_miss_with_unchanged_placement_is_not_rewritten() {
        let client = ScriptedClient::with_placements(&[FIRST, FIRST]);
        let p = proxy();
        perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();

        client.get_fails.store(true, Ordering::SeqCst);
        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 1)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Reset { displaced: false });
        assert_eq!(p.placement_writes(), 1);
        assert_eq!(total_mem(&p), 60);
        assert_eq!(chunk_at(&p, 2, 2, "A").reset_count, 1);
    }

    #[tokio::test]
    async fn test_miss_with_moved_shard_rewrites_placement() {
        let moved: &[usize] = &[0, 1, 2, 3, 4, 7];
        let client = ScriptedClient::with_placements(&[FIRST, moved]);
        let p = proxy();
        perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();

        client.get_fails.store(true, Ordering::SeqCst);
        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 1)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Reset { displaced: true });
        assert_eq!(p.placements("A"), Some(moved.to_vec()));
        assert_eq!(p.placement_writes(), 2);
        assert_eq!(p.slots()[5].mem_used(), 0);
        assert_eq!(p.slots()[7].mem_used(), 10);
        assert_eq!(chunk_at(&p, 7, 5, "A").reset_count, 1);
        assert!(p.slots().iter().all(|s| s.is_consistent()));
    }

    #[tokio::test]
    async fn test_evicted_shard_is_revived() {
        let client = ScriptedClient::with_placements(&[FIRST, FIRST]);
        let p = proxy();
        perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();

        let parked = p.del_chunk(3, &ChunkKey::new(3, "A")).unwrap().unwrap();
        p.park(parked);
        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 1)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::Reset { displaced: true });
        assert!(!p.is_evicted(&ChunkKey::new(3, "A")));
        assert_eq!(chunk_at(&p, 3, 3, "A").reset_count, 1);
        assert_eq!(total_mem(&p), 60);
    }

    #[tokio::test]
    async fn test_lost_shard_is_consistency_error_without_mutation() {
        let client = ScriptedClient::with_placements(&[FIRST, &[7, 6, 2, 3, 4, 5]]);
        let p = proxy();
        perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();
        p.del_chunk(4, &ChunkKey::new(4, "A")).unwrap();

        let err = perform(&ctx(), &client, &p, &record("A", 40, 1)).await.unwrap_err();
        assert_matches!(err, Error::Consistency { shard: 4, slot: 4, .. });
        assert_eq!(p.placements("A"), Some(FIRST.to_vec()));
        assert_eq!(chunk_at(&p, 0, 0, "A").reset_count, 0);
        assert_eq!(p.slots()[7].num_chunks(), 0);
    }

    #[tokio::test]
    async fn test_shard_evicted_after_validation_is_a_miss() {
        let client = ScriptedClient::with_placements(&[FIRST]);
        let p = proxy();
        let obj = record("A", 40, 0);
        perform(&ctx(), &client, &p, &obj).await.unwrap();
        assert!(p.validate(&obj));

        let parked = p.del_chunk(2, &ChunkKey::new(2, "A")).unwrap().unwrap();
        p.park(parked);
        assert!(!record_hit(&p, &obj, FIRST).unwrap());

        p.get_evicted(&ChunkKey::new(2, "A")).unwrap();
        let err = record_hit(&p, &obj, FIRST).unwrap_err();
        assert_matches!(err, Error::Consistency { shard: 2, slot: 2, .. });
    }

    #[tokio::test]
    async fn test_failed_set_commits_nothing() {
        let client = ScriptedClient::with_placements(&[FIRST]);
        client.set_fails.store(true, Ordering::SeqCst);
        let p = proxy();
        let (_, outcome) = perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap();
        assert_eq!(outcome, PerformOutcome::SetFailed);
        assert!(p.placements("A").is_none());
        assert_eq!(total_mem(&p), 0);
    }

    #[tokio::test]
    async fn test_short_backend_placement_rejected() {
        let client = ScriptedClient::with_placements(&[&[0, 1, 2]]);
        let p = proxy();
        let err = perform(&ctx(), &client, &p, &record("A", 40, 0)).await.unwrap_err();
        assert_matches!(err, Error::Backend { op: "set", .. });
    }
}
