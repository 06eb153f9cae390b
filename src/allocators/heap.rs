//! Heap allocator backed by the global allocator

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::traits::Allocator;
use crate::error::{NeuronError, Result};

/// Unbounded allocator using the process heap
///
/// Every allocation uses the same alignment so that `deallocate` can rebuild
/// the layout from the size alone.
#[derive(Debug)]
pub struct HeapAllocator {
    alignment: usize,
    used: AtomicUsize,
}

impl HeapAllocator {
    /// Create a heap allocator with the given alignment
    pub fn new(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(NeuronError::invalid_parameter(
                "alignment",
                "Alignment must be a power of two",
            ));
        }

        Ok(Self {
            alignment,
            used: AtomicUsize::new(0),
        })
    }

    fn layout(&self, size: usize) -> Result<Layout> {
        Layout::from_size_align(size, self.alignment)
            .map_err(|_| NeuronError::out_of_memory(size))
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self {
            alignment: std::mem::align_of::<u64>(),
            used: AtomicUsize::new(0),
        }
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(NeuronError::invalid_parameter(
                "size",
                "Zero-sized allocations are not supported",
            ));
        }

        if align > self.alignment {
            return Err(NeuronError::invalid_parameter(
                "align",
                format!("Alignment {} exceeds allocator alignment {}", align, self.alignment),
            ));
        }

        let layout = self.layout(size)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| NeuronError::out_of_memory(size))?;

        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let layout = self.layout(size)?;
        // SAFETY: callers return pointers obtained from `allocate(size, _)`
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        self.used.fetch_sub(size, Ordering::Relaxed);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn used_size(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn alignment(&self) -> usize {
        self.alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocation_accounting() {
        let allocator = HeapAllocator::new(64).unwrap();
        let ptr = allocator.allocate(1000, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        assert_eq!(allocator.used_size(), 1000);
        assert!(allocator.available_size().is_none());

        allocator.deallocate(ptr, 1000).unwrap();
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn test_heap_rejects_bad_parameters() {
        assert!(HeapAllocator::new(3).is_err());

        let allocator = HeapAllocator::new(8).unwrap();
        assert!(allocator.allocate(0, 8).is_err());
        assert!(allocator.allocate(16, 64).is_err());
    }
}
