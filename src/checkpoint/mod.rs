//! Resumable Checkpoint Log
//!
//! Append-only log of processed trace-record indices, one decimal value per
//! line. On open the log is replayed into a [`SeenIndex`] so a restarted
//! replay can skip work already done; new indices are handed to a background
//! appender through a bounded channel so the replay hot path never waits on
//! disk I/O.

mod seen;

pub use seen::SeenIndex;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Depth of the hand-off queue between producers and the appender
pub const TRACKER_QUEUE_DEPTH: usize = 1000;

/// Value that tells the appender to stop
const STOP_SENTINEL: i64 = -1;

/// Durable record of which trace positions have been processed
pub struct Checkpoint {
    path: PathBuf,
    seen: SeenIndex,
    frontier: Arc<AtomicI64>,
    tracker: mpsc::Sender<i64>,
    appender: parking_lot::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Checkpoint {
    /// Open (or create) the log at `path`, load it, and start the appender.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut seen = SeenIndex::new();
        let frontier = seen.load(BufReader::new(&mut file)).await?;
        info!(
            "Loaded checkpoint {} (frontier {})",
            path.display(),
            frontier
        );

        let frontier = Arc::new(AtomicI64::new(frontier));
        let (tx, rx) = mpsc::channel(TRACKER_QUEUE_DEPTH);
        let appender = tokio::spawn(track(rx, file, Arc::clone(&frontier)));

        Ok(Self {
            path,
            seen,
            frontier,
            tracker: tx,
            appender: parking_lot::Mutex::new(Some(appender)),
        })
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `index` was recorded in the log at load time.
    pub fn seen(&self, index: i64) -> bool {
        self.seen.contains(index)
    }

    /// Largest index ever recorded.
    pub fn frontier(&self) -> i64 {
        self.frontier.load(Ordering::Acquire)
    }

    /// Queue `index` for durable recording.
    pub async fn check_sync(&self, index: i64) -> Result<()> {
        if index < 0 {
            return Err(Error::Checkpoint(format!("negative index {}", index)));
        }
        self.tracker
            .send(index)
            .await
            .map_err(|_| Error::Checkpoint("appender has stopped".to_string()))
    }

    /// Stop the appender and close the file.
    ///
    /// Indices queued before this call are written before the appender stops;
    /// callers still must not enqueue concurrently with `close`.
    pub async fn close(&self) -> Result<()> {
        let appender = self.appender.lock().take();
        let Some(appender) = appender else {
            return Ok(());
        };
        if self.tracker.send(STOP_SENTINEL).await.is_err() {
            warn!("Checkpoint appender exited before close");
        }
        appender
            .await
            .map_err(|e| Error::Internal(format!("checkpoint appender panicked: {}", e)))?
    }
}

/// Background consumer: appends each queued index and folds it into the frontier.
async fn track(
    mut rx: mpsc::Receiver<i64>,
    file: File,
    frontier: Arc<AtomicI64>,
) -> Result<()> {
    let mut writer = BufWriter::new(file);
    'outer: while let Some(index) = rx.recv().await {
        let mut next = Some(index);
        // Batch whatever is already queued before flushing.
        while let Some(index) = next {
            if index < 0 {
                break 'outer;
            }
            writer.write_all(format!("{}\n", index).as_bytes()).await?;
            frontier.fetch_max(index, Ordering::AcqRel);
            next = rx.try_recv().ok();
        }
        writer.flush().await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    debug!("Checkpoint appender stopped");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_round_trip_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.ckpt");

        let checkpoint = Checkpoint::open(&path).await.unwrap();
        for index in [3, 1, 4, 1, 5] {
            checkpoint.check_sync(index).await.unwrap();
        }
        checkpoint.close().await.unwrap();
        assert_eq!(checkpoint.frontier(), 5);

        let reopened = Checkpoint::open(&path).await.unwrap();
        assert!(reopened.seen(1));
        assert!(!reopened.seen(2));
        assert!(reopened.seen(3));
        assert!(reopened.seen(5));
        assert_eq!(reopened.frontier(), 5);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_format_one_index_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.ckpt");

        let checkpoint = Checkpoint::open(&path).await.unwrap();
        checkpoint.check_sync(10).await.unwrap();
        checkpoint.check_sync(2).await.unwrap();
        checkpoint.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "10\n2\n");
    }

    #[tokio::test]
    async fn test_seen_is_not_updated_by_new_records() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("c")).await.unwrap();
        checkpoint.check_sync(7).await.unwrap();
        checkpoint.close().await.unwrap();

        assert!(!checkpoint.seen(7));
        assert_eq!(checkpoint.frontier(), 7);
    }

    #[tokio::test]
    async fn test_negative_index_rejected() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("c")).await.unwrap();
        assert!(checkpoint.check_sync(-3).await.is_err());
        checkpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint::open(dir.path().join("c")).await.unwrap();
        checkpoint.close().await.unwrap();
        checkpoint.close().await.unwrap();
        assert!(checkpoint.check_sync(1).await.is_err());
    }
}
