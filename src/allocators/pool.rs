//! Pool allocator implementation - fixed-size block allocation
//!
//! Blocks are the unit of reuse for buffer segments: a segment never spans
//! two blocks and a released block is handed out again as-is.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use super::traits::Allocator;
use crate::error::{NeuronError, Result};

/// Pool allocator for fixed-size blocks
#[derive(Debug)]
pub struct PoolAllocator {
    /// Base pointer to the memory region
    base_ptr: NonNull<u8>,
    /// Layout of the owned arena, freed on drop
    layout: Layout,
    /// Size of each block, a multiple of the alignment
    block_size: usize,
    /// Total number of blocks
    total_blocks: usize,
    /// Offsets of free blocks
    free_list: Mutex<Vec<usize>>,
    /// Number of allocated blocks
    allocated_count: AtomicUsize,
}

impl PoolAllocator {
    const BLOCK_ALIGN: usize = std::mem::align_of::<u64>();

    /// Create a pool owning `block_count` blocks of `block_size` bytes
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        Self::with_alignment(block_size, block_count, Self::BLOCK_ALIGN)
    }

    /// Create a pool whose blocks all start on an `alignment` boundary
    ///
    /// Block sizes are rounded up to the alignment.
    pub fn with_alignment(block_size: usize, block_count: usize, alignment: usize) -> Result<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(NeuronError::invalid_parameter(
                "block_size",
                "Block size and block count must be non-zero",
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(NeuronError::invalid_parameter(
                "alignment",
                "Alignment must be a power of two",
            ));
        }

        let alignment = alignment.max(Self::BLOCK_ALIGN);
        let block_size = block_size
            .checked_add(alignment - 1)
            .map(|size| size & !(alignment - 1))
            .ok_or_else(|| NeuronError::invalid_parameter("block_size", "Block size overflows"))?;
        let total_size = block_size
            .checked_mul(block_count)
            .ok_or_else(|| NeuronError::invalid_parameter("block_count", "Pool size overflows"))?;
        let layout = Layout::from_size_align(total_size, alignment)
            .map_err(|_| NeuronError::invalid_parameter("block_count", "Pool size overflows"))?;

        // SAFETY: layout has non-zero size
        let base = unsafe { alloc::alloc(layout) };
        let base_ptr = NonNull::new(base).ok_or_else(|| NeuronError::out_of_memory(total_size))?;

        // Reversed so blocks are handed out in address order
        let free_list = (0..block_count).rev().map(|i| i * block_size).collect();

        Ok(Self {
            base_ptr,
            layout,
            block_size,
            total_blocks: block_count,
            free_list: Mutex::new(free_list),
            allocated_count: AtomicUsize::new(0),
        })
    }

    /// Get block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get total number of blocks
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Get number of free blocks
    pub fn free_blocks(&self) -> usize {
        self.total_blocks - self.allocated_count.load(Ordering::Acquire)
    }

    /// Check if allocator is full
    pub fn is_full(&self) -> bool {
        self.allocated_count.load(Ordering::Acquire) >= self.total_blocks
    }

    /// Validate that an offset corresponds to a valid block boundary
    fn is_valid_block_offset(&self, offset: usize) -> bool {
        offset % self.block_size == 0 && offset < self.total_blocks * self.block_size
    }
}

impl Allocator for PoolAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size > self.block_size {
            return Err(NeuronError::out_of_memory(size));
        }

        if align > self.layout.align() {
            return Err(NeuronError::invalid_parameter(
                "align",
                format!(
                    "Alignment {} exceeds pool alignment {}",
                    align,
                    self.layout.align()
                ),
            ));
        }

        let offset = self
            .free_list
            .lock()
            .pop()
            .ok_or_else(|| NeuronError::out_of_memory(size))?;
        self.allocated_count.fetch_add(1, Ordering::AcqRel);

        // SAFETY: offset is a block boundary inside the arena
        Ok(unsafe { NonNull::new_unchecked(self.base_ptr.as_ptr().add(offset)) })
    }

    fn deallocate(&self, ptr: NonNull<u8>, _size: usize) -> Result<()> {
        let ptr_addr = ptr.as_ptr() as usize;
        let base_addr = self.base_ptr.as_ptr() as usize;

        let offset = ptr_addr.checked_sub(base_addr).filter(|&o| self.is_valid_block_offset(o));
        let offset = offset.ok_or_else(|| {
            NeuronError::invalid_parameter("ptr", "Pointer not owned by this allocator")
        })?;

        self.free_list.lock().push(offset);
        self.allocated_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.total_blocks * self.block_size)
    }

    fn used_size(&self) -> usize {
        self.allocated_count.load(Ordering::Acquire) * self.block_size
    }

    fn max_allocation(&self) -> Option<usize> {
        Some(self.block_size)
    }

    fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        // SAFETY: allocated in `with_alignment` with this layout
        unsafe { alloc::dealloc(self.base_ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the arena is only reached through block offsets handed out once
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}
