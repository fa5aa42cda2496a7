//! Replay Scheduler
//!
//! Drives a trace in file order. For every record it computes the wait that
//! reproduces the trace's temporal shape, takes a gate permit and a pooled
//! client, and spawns the record's simulation. Records complete out of
//! order; per-key ordering is kept by the proxy's key locks.
//!
//! # Pacing
//!
//! - **Absolute**: `(ts - origin) - skipped - elapsed`, clamped at zero, so
//!   a replay that falls behind catches up instead of drifting.
//! - **Compact**: `min(interval, ts - previous ts)`; zero in dry-run.
//!
//! Records before the skip offset, and records the checkpoint already holds,
//! are not dispatched; their wait is folded into `skipped` so later records
//! keep their spacing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tokio::io::AsyncBufRead;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ClientProvider;
use crate::checkpoint::Checkpoint;
use crate::domain::{Client, TraceRecord};
use crate::error::{Error, Result};
use crate::pool::{new_pool, Finalizer, Pool, PoolPolicy};
use crate::proxy::Proxy;
use crate::ring::ConsistentRing;

use super::gate::{ConcurrencyGate, GatePermit};
use super::perform::{perform, PerformContext};
use super::summary::{write_timings, RunSummary, TimingEntry};
use super::trace::{TraceReader, TraceRow};
use super::ReplayConfig;

type ClientPool = Arc<dyn Pool<Arc<dyn Client>>>;

/// Failure counters updated by dispatched units
#[derive(Debug, Default)]
struct Failures {
    consistency: AtomicU64,
    other: AtomicU64,
}

/// Trace-driven scheduler over a fixed set of proxies
pub struct ReplayScheduler {
    config: ReplayConfig,
    ring: ConsistentRing,
    proxies: Arc<[Proxy]>,
    clients: ClientPool,
    pool_policy: PoolPolicy,
    checkpoint: Option<Arc<Checkpoint>>,
}

impl ReplayScheduler {
    /// Build proxies, ring, client pool and checkpoint for `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn new(config: ReplayConfig, provider: ClientProvider) -> Result<Self> {
        config.validate()?;

        let proxies = (0..config.addresses.len())
            .map(|id| Proxy::new(id, config.proxy_config()))
            .collect::<Result<Vec<_>>>()?;
        let ring = ConsistentRing::new(0..proxies.len(), config.ring.clone())?;

        let pool_policy = if config.strict_client_pool {
            PoolPolicy::StrictConcurrency
        } else {
            PoolPolicy::Performance
        };
        let handle = Handle::current();
        let finalize: Finalizer<Arc<dyn Client>> = Box::new(move |client| {
            handle.spawn(async move { client.close().await });
        });
        let clients = new_pool(config.concurrency, pool_policy, provider, Some(finalize));

        let checkpoint = match &config.checkpoint {
            Some(path) => Some(Arc::new(Checkpoint::open(path).await?)),
            None => None,
        };

        info!(
            "Replay prepared: {} proxies x {} slots, {}+{} shards, balancer {}",
            proxies.len(),
            config.cluster_size,
            config.data_shards,
            config.parity_shards,
            config.effective_balancer()
        );

        Ok(Self {
            config,
            ring,
            proxies: Arc::from(proxies),
            clients,
            pool_policy,
            checkpoint,
        })
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn ring(&self) -> &ConsistentRing {
        &self.ring
    }

    /// Replay the trace file at `path`.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<RunSummary> {
        let mut reader = TraceReader::open(path, self.config.size_transform()).await?;
        self.run(&mut reader).await
    }

    /// Replay every row of `reader`, wait for stragglers, and summarize.
    ///
    /// A scheduler replays one trace: the checkpoint is closed at the end.
    #[instrument(name = "replay", skip_all)]
    pub async fn run<R>(&self, reader: &mut TraceReader<R>) -> Result<RunSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let gate = ConcurrencyGate::new(self.config.concurrency);
        let ctx = Arc::new(PerformContext::from_config(&self.config));
        let failures = Arc::new(Failures::default());
        let timings = self
            .config
            .timing_file
            .as_ref()
            .map(|_| Arc::new(Mutex::new(Vec::new())));

        let start = Instant::now();
        let mut skipped = Duration::ZERO;
        let mut origin: Option<NaiveDateTime> = None;
        let mut last: Option<NaiveDateTime> = None;
        let mut summary = RunSummary::default();
        let mut read: u64 = 0;

        while let Some(row) = reader.next_row().await? {
            let obj = match row {
                TraceRow::Record(obj) => obj,
                TraceRow::Malformed(e) => {
                    warn!("Error on parse record, skip: {}", e);
                    summary.malformed += 1;
                    read += 1;
                    continue;
                }
            };
            let index = read;
            read += 1;

            let resumed = self
                .checkpoint
                .as_ref()
                .is_some_and(|c| c.seen(index as i64));
            let dispatch = index >= self.config.skip && !resumed;

            let origin_ts = *origin.get_or_insert(obj.timestamp);
            if let Some(last_ts) = last {
                let wait = self.wait_time(&obj, origin_ts, last_ts, skipped, start.elapsed());
                if dispatch {
                    if !wait.is_zero() {
                        info!("Playback {} in {:?}", index + 1, wait);
                        tokio::time::sleep(wait).await;
                    }
                } else {
                    skipped += wait;
                    if !wait.is_zero() {
                        info!("Skip {}: {:?}", index + 1, wait);
                    }
                }
            }
            last = Some(obj.timestamp);

            if !dispatch {
                if resumed {
                    summary.resumed += 1;
                }
                continue;
            }

            let expected = trace_offset(obj.timestamp, origin_ts);
            info!(
                "{} Playbacking {}(exp {:?}, act {:?})...",
                index + 1,
                obj.key,
                Duration::from_nanos(expected.max(0) as u64),
                skipped + start.elapsed()
            );

            let member = self.ring.locate(obj.key.as_bytes());
            let permit = gate.acquire().await?;
            let client = self.acquire_client().await?;
            summary.dispatched += 1;

            let unit = Unit {
                ctx: Arc::clone(&ctx),
                proxies: Arc::clone(&self.proxies),
                member,
                clients: Arc::clone(&self.clients),
                checkpoint: self.checkpoint.clone(),
                failures: Arc::clone(&failures),
                timings: timings.clone(),
                index,
                expected,
                start,
                skipped,
            };
            gate.spawn(unit.run(obj, client, permit));
        }

        gate.wait().await;
        self.clients.close();
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.close().await?;
        }

        let mut aggregates = RunSummary::collect(&self.proxies);
        aggregates.records = read.saturating_sub(self.config.skip);
        aggregates.dispatched = summary.dispatched;
        aggregates.resumed = summary.resumed;
        aggregates.malformed = summary.malformed;
        aggregates.consistency_errors = failures.consistency.load(Ordering::Acquire);
        aggregates.failed = failures.other.load(Ordering::Acquire);
        aggregates.max_concurrency = gate.max_in_flight();

        if let (Some(path), Some(timings)) = (&self.config.timing_file, &timings) {
            write_timings(path, &timings.lock())?;
            debug!("Wrote request timings to {}", path.display());
        }
        Ok(aggregates)
    }

    /// Wait before dispatching `obj`.
    fn wait_time(
        &self,
        obj: &TraceRecord,
        origin: NaiveDateTime,
        last: NaiveDateTime,
        skipped: Duration,
        elapsed: Duration,
    ) -> Duration {
        if self.config.compact {
            if self.config.dry_run {
                return Duration::ZERO;
            }
            let gap = (obj.timestamp - last).to_std().unwrap_or_default();
            gap.min(self.config.interval)
        } else {
            (obj.timestamp - origin)
                .to_std()
                .unwrap_or_default()
                .saturating_sub(skipped + elapsed)
        }
    }

    async fn acquire_client(&self) -> Result<Arc<dyn Client>> {
        match self.pool_policy {
            PoolPolicy::Performance => Ok(self.clients.get()),
            PoolPolicy::StrictConcurrency => {
                let clients = Arc::clone(&self.clients);
                tokio::task::spawn_blocking(move || clients.get())
                    .await
                    .map_err(|e| Error::Internal(format!("client pool wait failed: {}", e)))
            }
        }
    }
}

/// Nanoseconds from `origin` to `ts` in trace time
fn trace_offset(ts: NaiveDateTime, origin: NaiveDateTime) -> i64 {
    (ts - origin).num_nanoseconds().unwrap_or(i64::MAX)
}

/// State moved into one dispatched record
struct Unit {
    ctx: Arc<PerformContext>,
    proxies: Arc<[Proxy]>,
    member: usize,
    clients: ClientPool,
    checkpoint: Option<Arc<Checkpoint>>,
    failures: Arc<Failures>,
    timings: Option<Arc<Mutex<Vec<TimingEntry>>>>,
    index: u64,
    expected: i64,
    start: Instant,
    skipped: Duration,
}

impl Unit {
    async fn run(self, obj: TraceRecord, client: Arc<dyn Client>, permit: GatePermit) {
        let result = match self.proxies.get(self.member) {
            Some(proxy) => perform(&self.ctx, client.as_ref(), proxy, &obj).await,
            None => Err(Error::Internal(format!("no proxy {}", self.member))),
        };
        let actual = self.skipped + self.start.elapsed();
        self.clients.put(client);

        match result {
            Ok((request_id, outcome)) => {
                let entry = TimingEntry::new(
                    outcome.operation(),
                    request_id,
                    obj.key,
                    self.expected,
                    i64::try_from(actual.as_nanos()).unwrap_or(i64::MAX),
                );
                debug!("csv,{}", entry.csv_line());
                if let Some(timings) = &self.timings {
                    timings.lock().push(entry);
                }
            }
            Err(e @ Error::Consistency { .. }) => {
                self.failures.consistency.fetch_add(1, Ordering::AcqRel);
                error!("Record {} aborted: {}", self.index + 1, e);
            }
            Err(e) if e.is_record_local() => {
                self.failures.other.fetch_add(1, Ordering::AcqRel);
                warn!("Record {} abandoned: {}", self.index + 1, e);
            }
            Err(e) => {
                self.failures.other.fetch_add(1, Ordering::AcqRel);
                error!("Record {} failed: {}", self.index + 1, e);
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            if let Err(e) = checkpoint.check_sync(self.index as i64).await {
                warn!("Failed to checkpoint record {}: {}", self.index + 1, e);
            }
        }
        drop(permit);
    }
}

// =============================================================================
// Tests
// =============================================================================
