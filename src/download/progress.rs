//! Batch progress counters with synchronous observers.
//!
//! Every `add_*` call updates the atomics and then hands a fresh
//! [`ProgressUpdate`] to each observer on the calling task. Observers must
//! be quick and must not register further observers.
//!
//! # Example
//!
//! ```
//! use mediafetch_core::download::ProgressTracker;
//!
//! let tracker = ProgressTracker::new(4);
//! tracker.add_observer(|update| println!("{:.0}%", update.percent()));
//! tracker.add_completed(1024);
//! tracker.add_skipped();
//! assert!((tracker.percent() - 50.0).abs() < f64::EPSILON);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// Minimum spacing between speed samples.
const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Immutable progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Items in the batch.
    pub total: usize,
    /// Items committed.
    pub completed: usize,
    /// Items failed.
    pub failed: usize,
    /// Items skipped.
    pub skipped: usize,
    /// Expected bytes, as far as known.
    pub bytes_total: u64,
    /// Bytes committed.
    pub bytes_done: u64,
    /// Time since the tracker was created.
    pub elapsed: Duration,
    /// Recent throughput in bytes per second.
    pub speed: f64,
}

impl ProgressUpdate {
    /// Items in a terminal state.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    /// `processed / total * 100`, or 0 for an empty batch.
    #[must_use]
    pub fn percent(&self) -> f64 {
        percent(self.processed(), self.total)
    }
}

/// Observer callback.
pub type ProgressObserver = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

#[derive(Debug)]
struct SpeedSample {
    at: Instant,
    bytes: u64,
    speed: f64,
}

/// Thread-safe batch progress counters.
pub struct ProgressTracker {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    bytes_total: AtomicU64,
    bytes_done: AtomicU64,
    started: Instant,
    sample: Mutex<SpeedSample>,
    observers: RwLock<Vec<ProgressObserver>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// Creates a tracker for a batch of `total` items.
    #[must_use]
    pub fn new(total: usize) -> Self {
        let now = Instant::now();
        Self {
            total: AtomicUsize::new(total),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            bytes_total: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            started: now,
            sample: Mutex::new(SpeedSample {
                at: now,
                bytes: 0,
                speed: 0.0,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Replaces the item total.
    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: impl Fn(&ProgressUpdate) + Send + Sync + 'static) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    /// An item committed `bytes` bytes.
    pub fn add_completed(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.bytes_done.fetch_add(bytes, Ordering::SeqCst);
        self.notify();
    }

    /// An item failed.
    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    /// An item was skipped.
    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.notify();
    }

    /// Adds to the expected byte total.
    pub fn add_bytes_total(&self, bytes: u64) {
        self.bytes_total.fetch_add(bytes, Ordering::SeqCst);
        self.notify();
    }

    /// Percent of items in a terminal state.
    #[must_use]
    pub fn percent(&self) -> f64 {
        let processed = self.completed.load(Ordering::SeqCst)
            + self.failed.load(Ordering::SeqCst)
            + self.skipped.load(Ordering::SeqCst);
        percent(processed, self.total.load(Ordering::SeqCst))
    }

    /// Builds a snapshot from the current counters.
    #[must_use]
    pub fn snapshot(&self) -> ProgressUpdate {
        let bytes_done = self.bytes_done.load(Ordering::SeqCst);
        ProgressUpdate {
            total: self.total.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            bytes_total: self.bytes_total.load(Ordering::SeqCst),
            bytes_done,
            elapsed: self.started.elapsed(),
            speed: self.sample_speed(bytes_done),
        }
    }

    /// Throughput since the previous sample; the last value is reused
    /// between samples.
    fn sample_speed(&self, bytes_done: u64) -> f64 {
        let mut sample = self.sample.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let window = now.saturating_duration_since(sample.at);
        if window >= SPEED_SAMPLE_INTERVAL {
            #[allow(clippy::cast_precision_loss)]
            let delta = bytes_done.saturating_sub(sample.bytes) as f64;
            sample.speed = delta / window.as_secs_f64();
            sample.at = now;
            sample.bytes = bytes_done;
        }
        sample.speed
    }

    fn notify(&self) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        if observers.is_empty() {
            return;
        }
        let update = self.snapshot();
        for observer in observers.iter() {
            observer(&update);
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    processed as f64 / total as f64 * 100.0
}
