//! Progress tracking - thread-safe counters with snapshot-on-read
//!
//! Every state transition is applied under one mutex, then an immutable
//! [`ExecutionProgress`] snapshot is handed to each registered callback in
//! registration order. Callbacks run inline with task completion, so they
//! must stay cheap (push to a channel, redraw a bar).

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Callback receiving a progress snapshot after every transition
pub type ProgressCallback = Arc<dyn Fn(&ExecutionProgress) + Send + Sync>;

/// Point-in-time view of a run
///
/// `completed` counts every task that reached a terminal state; `failed`
/// and `skipped` break that number down. The serialized form also carries
/// `completion_rate` and `estimated_remaining_time` (seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    pub pending: usize,
    pub skipped: usize,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
}

impl ExecutionProgress {
    /// Fraction of tasks finished, 0.0 - 1.0
    pub fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }

    /// `elapsed * (total - completed) / max(completed, 1)`
    pub fn estimated_remaining_time(&self) -> Duration {
        let remaining = self.total.saturating_sub(self.completed) as f64;
        let done = self.completed.max(1) as f64;
        Duration::try_from_secs_f64(self.elapsed.as_secs_f64() * remaining / done).unwrap_or(Duration::MAX)
    }

    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }
}

impl Serialize for ExecutionProgress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ExecutionProgress", 10)?;
        state.serialize_field("total", &self.total)?;
        state.serialize_field("completed", &self.completed)?;
        state.serialize_field("failed", &self.failed)?;
        state.serialize_field("running", &self.running)?;
        state.serialize_field("pending", &self.pending)?;
        state.serialize_field("skipped", &self.skipped)?;
        state.serialize_field("start_time", &self.start_time)?;
        state.serialize_field("elapsed", &self.elapsed.as_secs_f64())?;
        state.serialize_field("completion_rate", &self.completion_rate())?;
        state.serialize_field("estimated_remaining_time", &self.estimated_remaining_time().as_secs_f64())?;
        state.end()
    }
}

/// One state transition of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// Picked up by a worker
    Started,
    /// Finished and succeeded
    Succeeded,
    /// Finished with an error
    Failed,
    /// Never ran (upstream failure or cancellation)
    Skipped,
}

#[derive(Debug)]
struct Counters {
    total: usize,
    completed: usize,
    failed: usize,
    running: usize,
    pending: usize,
    skipped: usize,
}

impl Counters {
    fn apply(&mut self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Started => {
                self.pending = self.pending.saturating_sub(1);
                self.running += 1;
            }
            ProgressUpdate::Succeeded => {
                self.running = self.running.saturating_sub(1);
                self.completed += 1;
            }
            ProgressUpdate::Failed => {
                self.running = self.running.saturating_sub(1);
                self.completed += 1;
                self.failed += 1;
            }
            ProgressUpdate::Skipped => {
                self.pending = self.pending.saturating_sub(1);
                self.completed += 1;
                self.skipped += 1;
            }
        }
    }
}

/// Shared progress state for one run
pub struct ProgressTracker {
    counters: Mutex<Counters>,
    latest: RwLock<ExecutionProgress>,
    callbacks: RwLock<Vec<ProgressCallback>>,
    start: Instant,
    start_time: DateTime<Utc>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        let start_time = Utc::now();
        let counters = Counters {
            total,
            completed: 0,
            failed: 0,
            running: 0,
            pending: total,
            skipped: 0,
        };
        let latest = ExecutionProgress {
            total,
            completed: 0,
            failed: 0,
            running: 0,
            pending: total,
            skipped: 0,
            start_time,
            elapsed: Duration::ZERO,
        };

        Self {
            counters: Mutex::new(counters),
            latest: RwLock::new(latest),
            callbacks: RwLock::new(Vec::new()),
            start: Instant::now(),
            start_time,
        }
    }

    /// Register a callback; callbacks fire in registration order
    pub fn add_callback(&self, callback: ProgressCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Apply a transition and notify every callback with the new snapshot
    pub fn update(&self, update: ProgressUpdate) {
        // Holding the counter lock through dispatch keeps snapshots
        // delivered in the same order they were produced.
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.apply(update);
        let snapshot = self.snapshot_of(&counters);

        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();

        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for (i, callback) in callbacks.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                log::warn!("Progress callback #{} panicked; continuing", i);
            }
        }
        drop(counters);
    }

    /// Latest snapshot with a fresh `elapsed`
    pub fn get_stats(&self) -> ExecutionProgress {
        let mut snapshot = self.latest.read().unwrap_or_else(|e| e.into_inner()).clone();
        snapshot.elapsed = self.start.elapsed();
        snapshot
    }

    fn snapshot_of(&self, counters: &Counters) -> ExecutionProgress {
        ExecutionProgress {
            total: counters.total,
            completed: counters.completed,
            failed: counters.failed,
            running: counters.running,
            pending: counters.pending,
            skipped: counters.skipped,
            start_time: self.start_time,
            elapsed: self.start.elapsed(),
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("stats", &self.get_stats())
            .finish_non_exhaustive()
    }
}
