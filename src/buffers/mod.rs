//! Segmented message buffers
//!
//! Messages of any size are carried in chains of bounded segments obtained
//! from an [`Allocator`](crate::allocators::Allocator).

pub mod segment;
pub mod segmented;
pub mod stats;

pub use segment::Segment;
pub use segmented::{AllocFlags, BufferRange, BufferRangeMut, SegmentAllocator, SegmentedBuffer};
pub use stats::{AllocationStats, AtomicAllocationStats};
