//! Buffered write channel for tide points.
//!
//! Points are submitted without waiting through a [`WriteHandle`]; a
//! background task accumulates them and writes line protocol batches when
//! either:
//! - the batch size threshold is reached (size-based flush)
//! - the flush interval elapses (time-based flush)
//!
//! Failed writes are logged and counted, never surfaced to the submitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::point::TidePoint;
use crate::store::{Precision, TideStore};

/// Shortest accepted flush interval.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for the point writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Number of points to accumulate before triggering a flush
    pub batch_size: usize,

    /// Duration to wait before flushing, even if batch size not reached
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl WriterConfig {
    /// A zero batch size becomes 1 and the interval is raised to
    /// [`MIN_FLUSH_INTERVAL`].
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            flush_interval: flush_interval.max(MIN_FLUSH_INTERVAL),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.batch_size, config.flush_interval)
    }
}

/// Where the writer sends its batches.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub org_id: String,
    pub bucket: String,
}

/// Snapshot of writer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Points accepted by `submit`
    pub points_submitted: u64,

    /// Points the store acknowledged
    pub points_written: u64,

    /// Points that could not be encoded (non-finite height)
    pub points_dropped: u64,

    /// Points lost with a failed batch
    pub points_failed: u64,

    /// Write requests that succeeded
    pub batches_written: u64,

    /// Write requests that failed after retries
    pub batches_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    points_submitted: AtomicU64,
    points_written: AtomicU64,
    points_dropped: AtomicU64,
    points_failed: AtomicU64,
    batches_written: AtomicU64,
    batches_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriteStats {
        WriteStats {
            points_submitted: self.points_submitted.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            points_failed: self.points_failed.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
        }
    }
}

/// Errors returned when submitting a point.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The writer has been closed and is no longer accepting points
    #[error("Point writer has been closed")]
    Closed,
}

/// Cloneable, non-blocking submission handle.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<TidePoint>,
    counters: Arc<Counters>,
}

impl WriteHandle {
    /// Queue a point for writing. Never waits.
    pub fn submit(&self, point: TidePoint) -> Result<(), WriteError> {
        self.tx.send(point).map_err(|_| WriteError::Closed)?;
        self.counters.points_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> WriteStats {
        self.counters.snapshot()
    }
}

/// Owner of the background write task.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tide_ingest::memory::MemoryStore;
/// use tide_ingest::writer::{PointWriter, WriteTarget, WriterConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(MemoryStore::with_org("my-org"));
///     let target = WriteTarget { org_id: "org-0001".into(), bucket: "ocean_tides".into() };
///     let writer = PointWriter::spawn(store, target, WriterConfig::default());
///
///     // submit through writer.handle() ...
///
///     let stats = writer.close().await;
///     println!("{} points written", stats.points_written);
/// }
/// ```
pub struct PointWriter {
    handle: WriteHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PointWriter {
    /// Start the background task on the current runtime.
    pub fn spawn(store: Arc<dyn TideStore>, target: WriteTarget, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(write_task(
            rx,
            shutdown_rx,
            store,
            target,
            config,
            counters.clone(),
        ));

        Self {
            handle: WriteHandle { tx, counters },
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> WriteHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> WriteStats {
        self.handle.stats()
    }

    /// Stop accepting points, flush everything queued, and wait for the task.
    ///
    /// Outstanding handles start returning `WriteError::Closed`.
    pub async fn close(self) -> WriteStats {
        let counters = self.handle.counters.clone();
        drop(self.handle);
        // the task may already be gone if every handle was dropped
        let _ = self.shutdown.send(());

        if let Err(e) = self.task.await {
            warn!(error = %e, "Write task panicked during shutdown");
        }

        counters.snapshot()
    }
}

async fn write_task(
    mut rx: mpsc::UnboundedReceiver<TidePoint>,
    mut shutdown: oneshot::Receiver<()>,
    store: Arc<dyn TideStore>,
    target: WriteTarget,
    config: WriterConfig,
    counters: Arc<Counters>,
) {
    let batch_size = config.batch_size.max(1);
    let mut buffer: Vec<TidePoint> = Vec::with_capacity(batch_size);
    // fields are public, so a zero interval can still get here
    let mut ticker = interval(config.flush_interval.max(MIN_FLUSH_INTERVAL));

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_point = rx.recv() => {
                match maybe_point {
                    Some(point) => {
                        buffer.push(point);
                        if buffer.len() >= batch_size {
                            debug!(batch_size = buffer.len(), "Size-based flush triggered");
                            let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                            flush(store.as_ref(), &target, batch, &counters).await;
                        }
                    }
                    // every handle dropped
                    None => break,
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    debug!(batch_size = buffer.len(), "Time-based flush triggered");
                    let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                    flush(store.as_ref(), &target, batch, &counters).await;
                }
            }

            _ = &mut shutdown => {
                rx.close();
                while let Some(point) = rx.recv().await {
                    buffer.push(point);
                    if buffer.len() >= batch_size {
                        let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                        flush(store.as_ref(), &target, batch, &counters).await;
                    }
                }
                break;
            }
        }
    }

    if !buffer.is_empty() {
        info!(remaining = buffer.len(), "Writer closing, flushing remaining points");
        flush(store.as_ref(), &target, buffer, &counters).await;
    }

    let stats = counters.snapshot();
    info!(
        submitted = stats.points_submitted,
        written = stats.points_written,
        dropped = stats.points_dropped,
        failed = stats.points_failed,
        "Write task stopped"
    );
}

/// Encode a batch and write it; outcomes only reach the counters and logs.
async fn flush(store: &dyn TideStore, target: &WriteTarget, batch: Vec<TidePoint>, counters: &Counters) {
    let batch_id = Uuid::new_v4();
    let mut body = String::with_capacity(batch.len() * 64);
    let mut lines: u64 = 0;

    for point in &batch {
        match point.to_line_protocol() {
            Some(line) => {
                if lines > 0 {
                    body.push('\n');
                }
                body.push_str(&line);
                lines += 1;
            }
            None => {
                warn!(
                    location = %point.location,
                    timestamp = point.timestamp,
                    height = point.height,
                    "Dropping point with non-finite height"
                );
                counters.points_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    if lines == 0 {
        return;
    }

    match store
        .write(&target.org_id, &target.bucket, Precision::Seconds, body)
        .await
    {
        Ok(()) => {
            counters.points_written.fetch_add(lines, Ordering::Relaxed);
            counters.batches_written.fetch_add(1, Ordering::Relaxed);
            debug!(batch_id = %batch_id, points = lines, bucket = %target.bucket, "Wrote batch");
        }
        Err(e) => {
            counters.points_failed.fetch_add(lines, Ordering::Relaxed);
            counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            error!(batch_id = %batch_id, points = lines, error = %e, "Failed to write batch");
        }
    }
}
