//! A single fixed-capacity piece of a segmented buffer

use std::{ptr::NonNull, slice, sync::Arc};

use log::warn;

use super::stats::AtomicAllocationStats;
use crate::{
    allocators::{Allocator, AllocatorExt},
    error::Result,
};

/// Owned, zero-initialized memory obtained from an [`Allocator`]
///
/// `len` bytes are in use out of `capacity`. The memory goes back to the
/// allocator on drop. A zero-capacity segment owns no memory.
#[derive(Debug)]
pub struct Segment {
    data: NonNull<u8>,
    len: usize,
    capacity: usize,
    allocator: Arc<dyn Allocator>,
    stats: Option<Arc<AtomicAllocationStats>>,
}

impl Segment {
    /// Allocate a segment of exactly `capacity` bytes, fully in use
    pub fn allocate(
        allocator: Arc<dyn Allocator>,
        capacity: usize,
        align: usize,
        stats: Option<Arc<AtomicAllocationStats>>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::empty(allocator));
        }

        let data = allocator.allocate_zeroed(capacity, align)?;
        if let Some(stats) = &stats {
            stats.record_segment();
        }

        Ok(Self {
            data,
            len: capacity,
            capacity,
            allocator,
            stats,
        })
    }

    /// Segment that owns no memory
    pub fn empty(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            data: NonNull::dangling(),
            len: 0,
            capacity: 0,
            allocator,
            stats: None,
        }
    }

    /// Bytes in use
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no bytes are in use
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes owned
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// In-use bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `data` is valid for `capacity >= len` bytes, or dangling with len 0
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// In-use bytes, mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` gives exclusive access
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len = len;
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }

        if let Err(err) = self.allocator.deallocate(self.data, self.capacity) {
            warn!(
                "failed to release {} byte segment to {}: {}",
                self.capacity,
                self.allocator.type_name(),
                err
            );
        }

        if let Some(stats) = &self.stats {
            stats.record_segment_release();
        }
    }
}

// SAFETY: a segment exclusively owns its memory; the allocator is Send + Sync
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::HeapAllocator;

    #[test]
    fn test_segment_is_zeroed_and_released() {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::default());
        let stats = Arc::new(AtomicAllocationStats::new());

        {
            let mut segment =
                Segment::allocate(allocator.clone(), 128, 8, Some(stats.clone())).unwrap();
            assert_eq!(segment.len(), 128);
            assert!(segment.as_slice().iter().all(|&b| b == 0));
            segment.as_mut_slice()[0] = 7;
            assert_eq!(allocator.used_size(), 128);
        }

        assert_eq!(allocator.used_size(), 0);
        assert_eq!(stats.snapshot().segments_in_use, 0);
    }

    #[test]
    fn test_empty_segment_owns_nothing() {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::default());
        let segment = Segment::allocate(allocator.clone(), 0, 8, None).unwrap();
        assert!(segment.is_empty());
        assert_eq!(segment.as_slice(), &[] as &[u8]);
        drop(segment);
        assert_eq!(allocator.used_size(), 0);
    }
}
