//! Allocator trait definition

use std::ptr::NonNull;

use crate::error::Result;

/// Source of memory for buffer segments
///
/// Allocation failures are reported as `OutOfMemory`; the segmented buffer
/// allocator relies on that to roll back partially built buffers.
pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate memory of the given size and alignment
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Deallocate previously allocated memory
    fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<()>;

    /// Total bytes this allocator can hand out, `None` if unbounded
    fn capacity(&self) -> Option<usize>;

    /// Get the amount of used memory
    fn used_size(&self) -> usize;

    /// Get the amount of available memory, `None` if unbounded
    fn available_size(&self) -> Option<usize> {
        self.capacity()
            .map(|capacity| capacity.saturating_sub(self.used_size()))
    }

    /// Largest single allocation this allocator can satisfy, if limited
    fn max_allocation(&self) -> Option<usize> {
        None
    }

    /// Get allocator alignment guarantee
    fn alignment(&self) -> usize {
        std::mem::align_of::<usize>()
    }

    /// Get allocator type name for debugging
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Common allocator operations
pub trait AllocatorExt: Allocator {
    /// Allocate and zero-initialize memory
    fn allocate_zeroed(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let ptr = self.allocate(size, align)?;
        // SAFETY: `allocate` returned at least `size` writable bytes
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }
        Ok(ptr)
    }

    /// Check if allocator has enough space for allocation
    fn can_allocate(&self, size: usize) -> bool {
        let fits_block = self.max_allocation().map_or(true, |max| size <= max);
        let fits_space = self.available_size().map_or(true, |available| size <= available);
        fits_block && fits_space
    }

    /// Get utilization (0.0 to 1.0), zero for unbounded allocators
    fn utilization(&self) -> f64 {
        match self.capacity() {
            Some(capacity) if capacity > 0 => self.used_size() as f64 / capacity as f64,
            _ => 0.0,
        }
    }
}

// Blanket implementation for all Allocators
impl<T: Allocator + ?Sized> AllocatorExt for T {}
