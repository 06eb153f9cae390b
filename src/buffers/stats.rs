//! Segment allocation statistics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of segmented buffer allocation activity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationStats {
    /// Buffers successfully built
    pub buffers_allocated: u64,
    /// Buffer requests that failed with out-of-memory
    pub allocation_failures: u64,
    /// Segments obtained from the allocator
    pub segments_allocated: u64,
    /// Segments given back to the allocator
    pub segments_released: u64,
    /// Segments currently alive
    pub segments_in_use: usize,
    /// Peak number of live segments
    pub peak_segments: usize,
    /// Retries made by blocking allocations
    pub blocking_retries: u64,
}

impl AllocationStats {
    /// Fraction of buffer requests that succeeded (1.0 when idle)
    pub fn success_rate(&self) -> f64 {
        let total = self.buffers_allocated + self.allocation_failures;
        if total == 0 {
            return 1.0;
        }
        self.buffers_allocated as f64 / total as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "AllocationStats {{ buffers: {}, failures: {}, segments: {}/{} live, peak: {}, retries: {} }}",
            self.buffers_allocated,
            self.allocation_failures,
            self.segments_in_use,
            self.segments_allocated,
            self.peak_segments,
            self.blocking_retries
        )
    }
}

/// Thread-safe counters behind [`AllocationStats`]
#[derive(Debug, Default)]
pub struct AtomicAllocationStats {
    buffers_allocated: AtomicU64,
    allocation_failures: AtomicU64,
    segments_allocated: AtomicU64,
    segments_released: AtomicU64,
    segments_in_use: AtomicUsize,
    peak_segments: AtomicUsize,
    blocking_retries: AtomicU64,
}

impl AtomicAllocationStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_segment(&self) {
        self.segments_allocated.fetch_add(1, Ordering::Relaxed);
        let live = self.segments_in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_segments.fetch_max(live, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_release(&self) {
        self.segments_released.fetch_add(1, Ordering::Relaxed);
        self.segments_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer(&self) {
        self.buffers_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.blocking_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> AllocationStats {
        AllocationStats {
            buffers_allocated: self.buffers_allocated.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            segments_allocated: self.segments_allocated.load(Ordering::Relaxed),
            segments_released: self.segments_released.load(Ordering::Relaxed),
            segments_in_use: self.segments_in_use.load(Ordering::Relaxed),
            peak_segments: self.peak_segments.load(Ordering::Relaxed),
            blocking_retries: self.blocking_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_accounting() {
        let stats = AtomicAllocationStats::new();
        stats.record_segment();
        stats.record_segment();
        stats.record_segment_release();
        stats.record_buffer();
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.segments_allocated, 2);
        assert_eq!(snapshot.segments_in_use, 1);
        assert_eq!(snapshot.peak_segments, 2);
        assert_eq!(snapshot.success_rate(), 0.5);
        assert!(snapshot.summary().contains("failures: 1"));
    }
}
