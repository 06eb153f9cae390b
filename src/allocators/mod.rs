//! Memory sources for buffer segments

pub mod budget;
pub mod heap;
pub mod pool;
pub mod traits;

pub use budget::BudgetAllocator;
pub use heap::HeapAllocator;
pub use pool::PoolAllocator;
pub use traits::{Allocator, AllocatorExt};
