//! Run Summary
//!
//! End-of-run aggregates over every proxy's slots and evicted table, plus
//! the per-request timing log. Reporting only; nothing here feeds back into
//! the simulation.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::proxy::Proxy;

use super::Operation;

/// Aggregated outcome of one replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Rows read past the skip offset, malformed rows included
    pub records: u64,
    /// Records dispatched to the model
    pub dispatched: u64,
    /// Records skipped because the checkpoint had them
    pub resumed: u64,
    /// Unparseable rows
    pub malformed: u64,
    /// Records aborted on a missing shard
    pub consistency_errors: u64,
    /// Records aborted on any other error
    pub failed: u64,
    /// Bytes resident across all slots
    pub total_memory: u64,
    pub min_memory: u64,
    pub max_memory: u64,
    pub min_chunks: usize,
    pub max_chunks: usize,
    /// Resident chunks
    pub set: u64,
    /// Accesses, resident and evicted chunks
    pub got: u64,
    /// Miss recoveries, resident and evicted chunks
    pub reset: u64,
    /// Distinct active minutes summed over slots
    pub active_minutes: u64,
    /// Time spent in balancers, nanoseconds
    pub balancer_cost_ns: u64,
    pub max_concurrency: usize,
}

impl RunSummary {
    /// Aggregate slot and chunk statistics of `proxies`.
    pub fn collect(proxies: &[Proxy]) -> Self {
        let mut summary = Self {
            min_memory: u64::MAX,
            min_chunks: usize::MAX,
            ..Self::default()
        };
        let mut slots = 0usize;
        let mut balancer_cost = Duration::ZERO;

        for proxy in proxies {
            for slot in proxy.slots() {
                let mem = slot.mem_used();
                let chunks = slot.all_chunks();
                slots += 1;
                summary.total_memory += mem;
                summary.min_memory = summary.min_memory.min(mem);
                summary.max_memory = summary.max_memory.max(mem);
                summary.min_chunks = summary.min_chunks.min(chunks.len());
                summary.max_chunks = summary.max_chunks.max(chunks.len());
                summary.set += chunks.len() as u64;
                for chunk in &chunks {
                    summary.got += chunk.access_frequency;
                    summary.reset += chunk.reset_count;
                }
                summary.active_minutes += slot.active_minutes();
            }
            for chunk in proxy.all_evicts() {
                summary.got += chunk.access_frequency;
                summary.reset += chunk.reset_count;
            }
            balancer_cost += proxy.balancer_cost();
        }

        if slots == 0 {
            summary.min_memory = 0;
            summary.min_chunks = 0;
        }
        summary.balancer_cost_ns = u64::try_from(balancer_cost.as_nanos()).unwrap_or(u64::MAX);
        summary
    }

    pub fn balancer_cost(&self) -> Duration {
        Duration::from_nanos(self.balancer_cost_ns)
    }

    /// Balancer cost averaged over `records`
    pub fn balancer_cost_per_request(&self) -> Duration {
        match u32::try_from(self.records) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.balancer_cost() / n,
            Err(_) => Duration::from_nanos(self.balancer_cost_ns / self.records),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total records: {}", self.records)?;
        writeln!(f, "Total memory consumed: {}", format_bytes(self.total_memory))?;
        writeln!(
            f,
            "Memory consumed per lambda: {} - {}",
            format_bytes(self.min_memory),
            format_bytes(self.max_memory)
        )?;
        writeln!(f, "Chunks per lambda: {} - {}", self.min_chunks, self.max_chunks)?;
        writeln!(f, "Set {}, Got {}, Reset {}", self.set, self.got, self.reset)?;
        writeln!(f, "Active Minutes {}", self.active_minutes)?;
        writeln!(
            f,
            "BalancerCost: {:?}({:?} per request)",
            self.balancer_cost(),
            self.balancer_cost_per_request()
        )?;
        writeln!(f, "Max concurrency: {}", self.max_concurrency)?;
        write!(
            f,
            "Malformed rows: {}, Resumed: {}, Consistency errors: {}, Failed: {}",
            self.malformed, self.resumed, self.consistency_errors, self.failed
        )
    }
}

/// Human-readable binary byte count
pub fn format_bytes(size: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;
    if size >= TIB {
        format!("{:.2} TiB", size as f64 / TIB as f64)
    } else if size >= GIB {
        format!("{:.2} GiB", size as f64 / GIB as f64)
    } else if size >= MIB {
        format!("{:.2} MiB", size as f64 / MIB as f64)
    } else if size >= KIB {
        format!("{:.2} KiB", size as f64 / KIB as f64)
    } else {
        format!("{} B", size)
    }
}

// =============================================================================
// Timing Log
// =============================================================================

/// Expected versus actual dispatch offset of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingEntry {
    pub op: String,
    pub request_id: String,
    pub key: String,
    /// Trace offset from the first record
    pub expected_ns: i64,
    /// Wall-clock offset from replay start, skipped time included
    pub actual_ns: i64,
}

impl TimingEntry {
    pub fn new(op: Operation, request_id: String, key: String, expected: i64, actual: i64) -> Self {
        Self {
            op: op.to_string(),
            request_id,
            key,
            expected_ns: expected,
            actual_ns: actual,
        }
    }

    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.op, self.request_id, self.key, self.expected_ns, self.actual_ns
        )
    }
}

/// Write timing entries as CSV with a header row.
pub fn write_timings(path: &Path, entries: &[TimingEntry]) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    writeln!(writer, "op,request_id,key,expected_ns,actual_ns")?;
    for entry in entries {
        writeln!(writer, "{}", entry.csv_line())?;
    }
    writer.flush()?;
    Ok(())
}
