//! Progress reporting sinks for long attribution runs.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives progress as prompts are scored. Never required by the estimator.
pub trait ProgressSink: Send + Sync {
    /// `n` more prompts have been scored.
    fn advance(&self, n: usize);
}

/// Logs progress through `tracing` at debug level.
#[derive(Debug)]
pub struct TracingProgress {
    total: usize,
    done: AtomicUsize,
}

impl TracingProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            done: AtomicUsize::new(0),
        }
    }
}

impl ProgressSink for TracingProgress {
    fn advance(&self, n: usize) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        tracing::debug!(done, total = self.total, "Attribution progress");
    }
}

/// Counts advances; useful in tests and for polling from another task.
#[derive(Debug, Default)]
pub struct CountingProgress {
    count: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total advanced so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Number of `advance` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CountingProgress {
    fn advance(&self, n: usize) {
        self.count.fetch_add(n, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}
