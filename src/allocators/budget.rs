//! Byte-quota wrapper around another allocator

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use super::traits::Allocator;
use crate::error::{NeuronError, Result};

/// Enforces a memory quota on top of an inner allocator
///
/// The quota is reserved before the inner allocator is asked, so concurrent
/// callers can never overshoot it.
#[derive(Debug)]
pub struct BudgetAllocator {
    inner: Arc<dyn Allocator>,
    budget: usize,
    reserved: AtomicUsize,
}

impl BudgetAllocator {
    /// Limit `inner` to `budget` bytes in flight
    pub fn new(inner: Arc<dyn Allocator>, budget: usize) -> Self {
        Self {
            inner,
            budget,
            reserved: AtomicUsize::new(0),
        }
    }

    /// Configured quota in bytes
    pub fn budget(&self) -> usize {
        self.budget
    }

    fn reserve(&self, size: usize) -> Result<()> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved
                    .checked_add(size)
                    .filter(|&total| total <= self.budget)
            })
            .map(|_| ())
            .map_err(|_| NeuronError::out_of_memory(size))
    }

    fn release(&self, size: usize) {
        self.reserved.fetch_sub(size, Ordering::AcqRel);
    }
}

impl Allocator for BudgetAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.reserve(size)?;
        self.inner.allocate(size, align).map_err(|err| {
            self.release(size);
            err
        })
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        self.inner.deallocate(ptr, size)?;
        self.release(size);
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        Some(match self.inner.capacity() {
            Some(inner) => inner.min(self.budget),
            None => self.budget,
        })
    }

    fn used_size(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    fn max_allocation(&self) -> Option<usize> {
        self.inner.max_allocation()
    }

    fn alignment(&self) -> usize {
        self.inner.alignment()
    }
}
