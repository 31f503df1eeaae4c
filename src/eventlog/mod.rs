//! Durable append-only event log with rotation and backpressure.
//!
//! One JSON record per line, batched in memory and written to the active
//! segment by a single logical writer. Rotation finalizes the active
//! segment with a durability barrier and opens a fresh one; the deferred
//! uploader only ever reads finalized segments.
//!
//! # Architecture
//!
//! ```text
//! append() ──→ in-memory buffer (≤ flush threshold, ≤ max_events)
//!                  │ flush threshold reached, or flush timer fires
//!                  ▼
//!            active segment file (events.active.jsonl)
//!                  │ max_bytes would be exceeded, max_age elapsed,
//!                  │ or rotate() called
//!                  ▼
//!            finalized segment (events-<timestamp>-<suffix>.jsonl, fsynced)
//! ```
//!
//! # Durability contract
//!
//! A successful `append` does **not** promise the record is on disk. A
//! successful `rotate` or `close` does: every record accepted before the
//! call is in a finalized, fsynced segment when it returns.

use rand::Rng;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{RelayError, RelayResult};
use crate::events::ActivityEvent;

/// Name of the segment currently being written. Stable within a run;
/// everything else in the directory is finalized and immutable.
pub const ACTIVE_SEGMENT: &str = "events.active.jsonl";

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub dir: PathBuf,
    /// Rotate before the active segment would exceed this many bytes.
    pub max_bytes: u64,
    /// Rotate when the active segment is older than this and non-empty.
    pub max_age: Duration,
    /// Backpressure ceiling on buffered (unflushed) records.
    pub max_events: usize,
    /// Flush once this many records are buffered.
    pub flush_threshold: usize,
    /// Flush at least this often.
    pub flush_interval: Duration,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./segments"),
            max_bytes: 16 * 1024 * 1024,
            max_age: Duration::from_secs(60),
            max_events: 100_000,
            flush_threshold: 100,
            flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogStats {
    pub appended: u64,
    pub flushes: u64,
    pub rotations: u64,
    pub pending: usize,
    pub active_segment_bytes: u64,
    pub backpressure_rejections: u64,
    pub io_errors: u64,
}

struct Segment {
    file: File,
    /// Bytes accounted to this segment: flushed plus still-buffered.
    bytes: u64,
    records: u64,
    opened_at: Instant,
}

struct LogInner {
    segment: Segment,
    buffer: Vec<u8>,
    buffered_records: usize,
}

/// Single-writer append-only log. Cheap to share: `append` takes `&self`.
pub struct EventLog {
    cfg: EventLogConfig,
    inner: Mutex<LogInner>,
    /// Mirror of the buffered-record count, readable without the lock for
    /// the backpressure check.
    pending: AtomicUsize,
    rotating: AtomicBool,
    closed: AtomicBool,
    appended: AtomicU64,
    flushes: AtomicU64,
    rotations: AtomicU64,
    backpressure_rejections: AtomicU64,
    io_errors: AtomicU64,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventLog {
    /// Open the log, finalizing any active segment left over from a
    /// previous run.
    pub fn open(cfg: EventLogConfig) -> RelayResult<Self> {
        std::fs::create_dir_all(&cfg.dir)?;

        let active = cfg.dir.join(ACTIVE_SEGMENT);
        if active.exists() {
            let orphan = finalized_name(&cfg.dir);
            tracing::warn!(from = %active.display(), to = %orphan.display(), "finalizing active segment from previous run");
            std::fs::rename(&active, &orphan)?;
        }

        let segment = open_segment(&cfg.dir)?;
        Ok(Self {
            cfg,
            inner: Mutex::new(LogInner {
                segment,
                buffer: Vec::with_capacity(64 * 1024),
                buffered_records: 0,
            }),
            pending: AtomicUsize::new(0),
            rotating: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            appended: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
            flush_task: Mutex::new(None),
        })
    }

    /// Start the background flush/rotation timer.
    pub fn start(self: &Arc<Self>) {
        let log = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(log.cfg.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if log.closed.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = log.flush() {
                    // Left buffered; retried on the next tick.
                    tracing::warn!(error = %e, "timed flush failed");
                }
                let stale = {
                    let inner = log.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.segment.records > 0 && inner.segment.opened_at.elapsed() >= log.cfg.max_age
                };
                if stale {
                    if let Err(e) = log.rotate() {
                        tracing::warn!(error = %e, "aged rotation failed");
                    }
                }
            }
        });
        *self.flush_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Append one event.
    ///
    /// Fails with `BackpressureError` once `max_events` records are
    /// buffered, and with `IOError` when the disk rejects the write.
    /// Records reach disk in append order within a segment.
    pub fn append(&self, mut event: ActivityEvent) -> RelayResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(RelayError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, "event log is closed"),
            });
        }
        let pending = self.pending.load(Ordering::Relaxed);
        if pending >= self.cfg.max_events {
            self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::Backpressure {
                pending,
                limit: self.cfg.max_events,
            });
        }

        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        let mut line = serde_json::to_vec(&event).map_err(|e| {
            RelayError::validation("event", format!("unserializable event: {e}"))
        })?;
        line.push(b'\n');

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Rotate first if this record would push the segment past the byte
        // bound; a single oversized record may exceed it by itself.
        if inner.segment.records > 0
            && inner.segment.bytes + line.len() as u64 > self.cfg.max_bytes
        {
            self.rotate_locked(&mut inner)?;
        }

        inner.buffer.extend_from_slice(&line);
        inner.buffered_records += 1;
        inner.segment.bytes += line.len() as u64;
        inner.segment.records += 1;
        self.pending.store(inner.buffered_records, Ordering::Relaxed);
        self.appended.fetch_add(1, Ordering::Relaxed);

        if inner.buffered_records >= self.cfg.flush_threshold {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Write all buffered records to the active segment, in order.
    pub fn flush(&self) -> RelayResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut LogInner) -> RelayResult<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = inner.segment.file.write_all(&inner.buffer) {
            // Keep the buffer; the next flush retries. The caller that
            // observed the failure still sees it.
            self.io_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        inner.buffer.clear();
        inner.buffered_records = 0;
        self.pending.store(0, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finalize the active segment and open a new one.
    ///
    /// Flushes pending records, closes the segment with a durability
    /// barrier, and renames it to an immutable timestamped file. Returns
    /// the finalized path, or `None` when the segment was empty or another
    /// rotation is already in progress.
    pub fn rotate(&self) -> RelayResult<Option<PathBuf>> {
        if self
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let result = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            self.rotate_locked(&mut inner)
        };
        self.rotating.store(false, Ordering::Release);
        result
    }

    fn rotate_locked(&self, inner: &mut LogInner) -> RelayResult<Option<PathBuf>> {
        if inner.segment.records == 0 {
            return Ok(None);
        }
        self.flush_locked(inner)?;
        inner.segment.file.sync_all()?;

        let finalized = finalized_name(&self.cfg.dir);
        std::fs::rename(self.cfg.dir.join(ACTIVE_SEGMENT), &finalized)?;

        inner.segment = open_segment(&self.cfg.dir)?;
        self.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(segment = %finalized.display(), "segment finalized");
        Ok(Some(finalized))
    }

    /// Flush, finalize, and stop the timer. The log refuses appends
    /// afterwards.
    pub fn close(&self) -> RelayResult<Option<PathBuf>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(handle) = self.flush_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let finalized = self.rotate_locked(&mut inner)?;
        tracing::info!("event log closed");
        Ok(finalized)
    }

    pub fn stats(&self) -> EventLogStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        EventLogStats {
            appended: self.appended.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            pending: inner.buffered_records,
            active_segment_bytes: inner.segment.bytes,
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

fn open_segment(dir: &Path) -> std::io::Result<Segment> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(ACTIVE_SEGMENT))?;
    Ok(Segment {
        file,
        bytes: 0,
        records: 0,
        opened_at: Instant::now(),
    })
}

/// Finalized segment name: wall-clock timestamp plus a random suffix so
/// rapid rotations never collide.
fn finalized_name(dir: &Path) -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let suffix: u16 = rand::thread_rng().gen();
    dir.join(format!("events-{ts}-{suffix:04x}.jsonl"))
}
