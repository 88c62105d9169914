//! Execution-time distribution of exited processes
//!
//! Bucket `i` counts processes whose lifetime CPU usage `t` (microseconds)
//! satisfies `10^i <= t < 10^(i+1)`; zero falls into bucket 0.

use serde::Serialize;
use std::time::Duration;

/// Number of histogram buckets
pub const HISTOGRAM_BUCKETS: usize = 32;

/// Bucket index for an execution time in microseconds
pub fn bucket_index(exec_time_us: u64) -> usize {
    // Integer log10 is exact at powers of ten, unlike f64::log10
    (exec_time_us.max(1).ilog10() as usize).min(HISTOGRAM_BUCKETS - 1)
}

/// Exclusive upper bound of a bucket, `None` when it exceeds `u64` microseconds
pub fn bucket_upper_bound(index: usize) -> Option<Duration> {
    let exponent = u32::try_from(index + 1).ok()?;
    10u64.checked_pow(exponent).map(Duration::from_micros)
}

#[derive(Debug, Clone, Default)]
pub struct HistogramRecorder {
    buckets: [u64; HISTOGRAM_BUCKETS],
}

impl HistogramRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, exec_time_us: u64) {
        let bucket = &mut self.buckets[bucket_index(exec_time_us)];
        *bucket = bucket.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.buckets = [0; HISTOGRAM_BUCKETS];
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets,
        }
    }
}

/// Copy of the histogram taken under the engine lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: [u64; HISTOGRAM_BUCKETS],
}

impl HistogramSnapshot {
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|&b| b == 0)
    }

    /// Indices of the first and last non-empty buckets
    pub fn occupied_range(&self) -> Option<(usize, usize)> {
        let first = self.buckets.iter().position(|&b| b != 0)?;
        let last = self.buckets.iter().rposition(|&b| b != 0)?;
        Some((first, last))
    }
}
