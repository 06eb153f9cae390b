//! Buffers of arbitrary size built from bounded segments
//!
//! A [`SegmentedBuffer`] is a head segment plus a chain of continuation
//! segments. Every segment is at most `max_segment_capacity` bytes, so large
//! messages never need one large contiguous allocation.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace};

use super::{
    segment::Segment,
    stats::{AllocationStats, AtomicAllocationStats},
};
use crate::{
    allocators::{Allocator, HeapAllocator},
    config::SegmentConfig,
    error::{NeuronError, Result},
};

/// How a segment allocation may behave when memory is short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFlags {
    /// Fail immediately, never sleep
    Atomic,
    /// Retry a failing segment until the timeout elapses
    ///
    /// `None` uses the allocator's configured blocking timeout.
    MayBlock { timeout: Option<Duration> },
}

impl AllocFlags {
    /// Blocking allocation with the configured timeout
    pub fn may_block() -> Self {
        Self::MayBlock { timeout: None }
    }
}

/// Message buffer made of a head segment and continuation segments
#[derive(Debug)]
pub struct SegmentedBuffer {
    head: Segment,
    continuations: Vec<Segment>,
    /// Bytes in use across all segments
    length: usize,
    /// Bytes in use in continuation segments
    data_length: usize,
    total_capacity: usize,
    /// Capacity plus per-segment bookkeeping
    accounted_size: usize,
}

impl SegmentedBuffer {
    fn from_head(head: Segment) -> Self {
        let mut buffer = Self {
            length: head.len(),
            data_length: 0,
            total_capacity: head.capacity(),
            accounted_size: head.capacity() + std::mem::size_of::<Segment>(),
            head,
            continuations: Vec::new(),
        };
        buffer.accounted_size += std::mem::size_of::<Self>();
        buffer
    }

    fn push(&mut self, segment: Segment) {
        self.length += segment.len();
        self.data_length += segment.len();
        self.total_capacity += segment.capacity();
        self.accounted_size += segment.capacity() + std::mem::size_of::<Segment>();
        self.continuations.push(segment);
    }

    /// Bytes in use
    pub fn len(&self) -> usize {
        self.length
    }

    /// Check if the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes held in continuation segments
    pub fn data_len(&self) -> usize {
        self.data_length
    }

    /// Sum of all segment capacities
    pub fn capacity(&self) -> usize {
        self.total_capacity
    }

    /// Memory charged for this buffer, bookkeeping included
    pub fn accounted_size(&self) -> usize {
        self.accounted_size
    }

    /// Number of segments, head included
    pub fn segment_count(&self) -> usize {
        1 + self.continuations.len()
    }

    /// Segments in order, head first
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        std::iter::once(&self.head).chain(self.continuations.iter())
    }

    fn segments_mut(&mut self) -> impl Iterator<Item = &mut Segment> + '_ {
        std::iter::once(&mut self.head).chain(self.continuations.iter_mut())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(NeuronError::invalid_parameter(
                "offset",
                format!(
                    "range {}+{} exceeds buffer length {}",
                    offset, len, self.length
                ),
            )),
        }
    }

    /// Copy `data` into the buffer starting at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;

        let mut skip = offset;
        let mut remaining = data;
        for segment in self.segments_mut() {
            if remaining.is_empty() {
                break;
            }
            let bytes = segment.as_mut_slice();
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let n = remaining.len().min(bytes.len() - skip);
            bytes[skip..skip + n].copy_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            skip = 0;
        }
        Ok(())
    }

    /// Copy bytes starting at `offset` into `out`
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, out.len())?;

        let mut skip = offset;
        let mut filled = 0;
        for segment in self.segments() {
            if filled == out.len() {
                break;
            }
            let bytes = segment.as_slice();
            if skip >= bytes.len() {
                skip -= bytes.len();
                continue;
            }
            let n = (out.len() - filled).min(bytes.len() - skip);
            out[filled..filled + n].copy_from_slice(&bytes[skip..skip + n]);
            filled += n;
            skip = 0;
        }
        Ok(())
    }

    /// Overwrite the buffer with `data` and shrink it to `data.len()`
    pub fn fill_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.total_capacity {
            return Err(NeuronError::invalid_parameter(
                "data",
                format!(
                    "{} bytes exceed buffer capacity {}",
                    data.len(),
                    self.total_capacity
                ),
            ));
        }
        self.set_len(data.len());
        self.write_at(0, data)
    }

    /// Set the number of bytes in use, filling segments in order
    pub fn set_len(&mut self, len: usize) {
        let len = len.min(self.total_capacity);
        let mut remaining = len;
        let mut data_length = 0;

        for (index, segment) in self.segments_mut().enumerate() {
            let used = remaining.min(segment.capacity());
            segment.set_len(used);
            remaining -= used;
            if index > 0 {
                data_length += used;
            }
        }

        self.length = len;
        self.data_length = data_length;
    }

    /// Copy the in-use bytes into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for segment in self.segments() {
            out.extend_from_slice(segment.as_slice());
        }
        out
    }

    /// Borrow `size` bytes starting at `offset` for a vectored send
    pub fn range(&self, offset: usize, size: usize) -> Result<BufferRange<'_>> {
        self.check_bounds(offset, size)?;
        Ok(BufferRange {
            buffer: self,
            offset,
            size,
        })
    }

    /// Borrow `size` bytes starting at `offset` for a vectored receive
    pub fn range_mut(&mut self, offset: usize, size: usize) -> Result<BufferRangeMut<'_>> {
        self.check_bounds(offset, size)?;
        Ok(BufferRangeMut {
            buffer: self,
            offset,
            size,
        })
    }
}

/// A window into a [`SegmentedBuffer`]: head, offset and size
#[derive(Debug, Clone, Copy)]
pub struct BufferRange<'a> {
    buffer: &'a SegmentedBuffer,
    offset: usize,
    size: usize,
}

impl<'a> BufferRange<'a> {
    /// Start of the window within the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the window
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Contiguous pieces of the window, in order
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let buffer: &'a SegmentedBuffer = self.buffer;
        let mut skip = self.offset;
        let mut remaining = self.size;
        buffer.segments().filter_map(move |segment| {
            let bytes = segment.as_slice();
            if remaining == 0 {
                return None;
            }
            if skip >= bytes.len() {
                skip -= bytes.len();
                return None;
            }
            let n = remaining.min(bytes.len() - skip);
            let chunk = &bytes[skip..skip + n];
            skip = 0;
            remaining -= n;
            Some(chunk)
        })
    }

    /// Copy the window into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Mutable window into a [`SegmentedBuffer`]
#[derive(Debug)]
pub struct BufferRangeMut<'a> {
    buffer: &'a mut SegmentedBuffer,
    offset: usize,
    size: usize,
}

impl BufferRangeMut<'_> {
    /// Start of the window within the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the window
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check if the window is empty
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copy `data` to the start of the window
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            return Err(NeuronError::invalid_parameter(
                "data",
                format!("{} bytes exceed range of {}", data.len(), self.size),
            ));
        }
        self.buffer.write_at(self.offset, data)
    }
}

/// Builds [`SegmentedBuffer`]s from an [`Allocator`]
#[derive(Debug, Clone)]
pub struct SegmentAllocator {
    allocator: Arc<dyn Allocator>,
    config: SegmentConfig,
    stats: Arc<AtomicAllocationStats>,
}

impl SegmentAllocator {
    /// Create a segment allocator drawing from `allocator`
    pub fn new(allocator: Arc<dyn Allocator>, config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        if config.alignment > allocator.alignment() {
            return Err(NeuronError::invalid_parameter(
                "alignment",
                format!(
                    "Segment alignment {} exceeds allocator alignment {}",
                    config.alignment,
                    allocator.alignment()
                ),
            ));
        }
        Ok(Self {
            allocator,
            config,
            stats: Arc::new(AtomicAllocationStats::new()),
        })
    }

    /// Heap-backed segment allocator
    pub fn heap(config: SegmentConfig) -> Result<Self> {
        let allocator = HeapAllocator::new(config.alignment)?;
        Self::new(Arc::new(allocator), config)
    }

    /// Largest segment this allocator will carve
    pub fn max_segment_capacity(&self) -> usize {
        match self.allocator.max_allocation() {
            Some(max) => max.min(self.config.max_segment_capacity),
            None => self.config.max_segment_capacity,
        }
    }

    /// Get allocation statistics
    pub fn stats(&self) -> AllocationStats {
        self.stats.snapshot()
    }

    /// Get configuration
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Build a buffer with `size` bytes in use
    ///
    /// On failure every segment obtained so far is released and
    /// `OutOfMemory` is returned; a partial buffer is never handed out.
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> Result<SegmentedBuffer> {
        let result = self.build(size, flags);
        match &result {
            Ok(buffer) => {
                self.stats.record_buffer();
                trace!(
                    "allocated {} byte buffer in {} segments",
                    size,
                    buffer.segment_count()
                );
            }
            Err(_) => {
                self.stats.record_failure();
                debug!("segmented allocation of {} bytes failed", size);
            }
        }
        result
    }

    fn build(&self, size: usize, flags: AllocFlags) -> Result<SegmentedBuffer> {
        if size == 0 {
            return Ok(SegmentedBuffer::from_head(Segment::empty(
                self.allocator.clone(),
            )));
        }

        let max = self.max_segment_capacity().max(1);
        let deadline = match flags {
            AllocFlags::Atomic => None,
            AllocFlags::MayBlock { timeout } => {
                Some(Instant::now() + timeout.unwrap_or(self.config.blocking_timeout))
            }
        };

        let mut remaining = size;
        let mut buffer: Option<SegmentedBuffer> = None;
        while remaining > 0 {
            let carve = remaining.min(max);
            // Dropping `buffer` on error releases the earlier segments
            let segment = self
                .segment(carve, deadline)
                .map_err(|_| NeuronError::out_of_memory(size))?;
            remaining -= carve;

            match buffer.as_mut() {
                None => buffer = Some(SegmentedBuffer::from_head(segment)),
                Some(buffer) => buffer.push(segment),
            }
        }

        buffer.ok_or_else(|| NeuronError::out_of_memory(size))
    }

    fn segment(&self, capacity: usize, deadline: Option<Instant>) -> Result<Segment> {
        loop {
            match Segment::allocate(
                self.allocator.clone(),
                capacity,
                self.config.alignment,
                Some(self.stats.clone()),
            ) {
                Ok(segment) => return Ok(segment),
                Err(err) => match deadline {
                    Some(deadline) if Instant::now() < deadline => {
                        self.stats.record_retry();
                        thread::sleep(Duration::from_micros(10));
                    }
                    _ => return Err(err),
                },
            }
        }
    }
}
