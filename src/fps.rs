//! Rolling frame-rate estimation.
//!
//! `FrameRateTracker` keeps a bounded FIFO window of per-frame read latencies
//! and derives an instantaneous frames-per-second estimate from their mean.

use std::collections::VecDeque;
use std::time::Duration;

/// Default number of latency samples kept in the window.
pub const DEFAULT_WINDOW: usize = 1000;

/// Bounded rolling window of per-frame latencies (milliseconds).
///
/// Not shared across cameras; each worker owns exactly one.
#[derive(Clone, Debug)]
pub struct FrameRateTracker {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for FrameRateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRateTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    /// Tracker with a custom window size. A zero capacity is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a latency sample, evicting the oldest samples past capacity.
    pub fn record(&mut self, latency_ms: f64) {
        self.samples.push_back(latency_ms);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn record_duration(&mut self, latency: Duration) {
        self.record(latency.as_secs_f64() * 1000.0);
    }

    /// Mean latency over the window, `None` when empty.
    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().sum();
        Some(total / self.samples.len() as f64)
    }

    /// `1000 / mean(latency)`.
    ///
    /// Returns `0.0` for an empty window or a non-positive mean.
    pub fn fps(&self) -> f64 {
        match self.mean_latency_ms() {
            Some(mean) if mean > 0.0 => 1000.0 / mean,
            _ => 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
