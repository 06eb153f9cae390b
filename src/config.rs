//! Bus and segment allocation configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NeuronError, Result};

/// Page size used to express segment limits
pub const PAGE_SIZE: usize = 4096;

/// Default largest segment: 17 pages
pub const DEFAULT_MAX_SEGMENT_CAPACITY: usize = 17 * PAGE_SIZE;

/// How a channel picks among open protocol slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Earliest registered protocol, then earliest declared slot
    #[default]
    FirstDeclared,
    /// Like `FirstDeclared`, but a named slot only accepts a channel of that name
    ByName,
}

/// Limits for building segmented buffers
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentConfig {
    /// Largest single segment in bytes
    pub max_segment_capacity: usize,
    /// Alignment requested for every segment
    pub alignment: usize,
    /// How long a `MayBlock` allocation keeps retrying a failing segment
    pub blocking_timeout: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_capacity: DEFAULT_MAX_SEGMENT_CAPACITY,
            alignment: std::mem::align_of::<u64>(),
            blocking_timeout: Duration::from_millis(100),
        }
    }
}

impl SegmentConfig {
    /// Set the segment size limit
    pub fn with_max_segment_capacity(mut self, capacity: usize) -> Self {
        self.max_segment_capacity = capacity;
        self
    }

    /// Set segment alignment
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the retry window for blocking allocations
    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_capacity == 0 {
            return Err(NeuronError::invalid_parameter(
                "max_segment_capacity",
                "Segment capacity cannot be zero",
            ));
        }

        if !self.alignment.is_power_of_two() {
            return Err(NeuronError::invalid_parameter(
                "alignment",
                "Alignment must be a power of two",
            ));
        }

        Ok(())
    }

    /// Number of segments a buffer of `size` bytes is split into
    pub fn segments_for(&self, size: usize) -> usize {
        if size == 0 {
            1
        } else {
            (size + self.max_segment_capacity - 1) / self.max_segment_capacity
        }
    }
}

/// Configuration of a [`Bus`](crate::bus::Bus)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BusConfig {
    /// Channel to slot tie-break policy
    pub match_policy: MatchPolicy,
    /// Segmented buffer limits for buffers allocated through the bus
    pub segments: SegmentConfig,
}

impl BusConfig {
    /// Set the match policy
    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    /// Set segment limits
    pub fn with_segments(mut self, segments: SegmentConfig) -> Self {
        self.segments = segments;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.segments.validate()
    }
}

/// Builder for [`BusConfig`]
#[derive(Debug, Default)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the match policy
    pub fn match_policy(mut self, policy: MatchPolicy) -> Self {
        self.config.match_policy = policy;
        self
    }

    /// Set the largest segment
    pub fn max_segment_capacity(mut self, capacity: usize) -> Self {
        self.config.segments.max_segment_capacity = capacity;
        self
    }

    /// Set segment alignment
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.config.segments.alignment = alignment;
        self
    }

    /// Set the blocking allocation retry window
    pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
        self.config.segments.blocking_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<BusConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_segment_limit() {
        let config = SegmentConfig::default();
        assert_eq!(config.max_segment_capacity, 69632);
        assert_eq!(config.segments_for(0), 1);
        assert_eq!(config.segments_for(69632), 1);
        assert_eq!(config.segments_for(69633), 2);
    }

    #[test]
    fn test_builder_validation() {
        let config = BusConfigBuilder::new()
            .match_policy(MatchPolicy::ByName)
            .max_segment_capacity(1024)
            .build()
            .unwrap();
        assert_eq!(config.match_policy, MatchPolicy::ByName);
        assert_eq!(config.segments.max_segment_capacity, 1024);

        assert!(BusConfigBuilder::new().max_segment_capacity(0).build().is_err());
        assert!(BusConfigBuilder::new().alignment(12).build().is_err());
    }
}
