//! Synchronization primitives for the driver binding engine
//!
//! - Epoch-based grace periods with lock-free readers
//! - RCU-style driver slots built on top of them
//! - eventfd-based notifiers for handing work to worker threads

pub mod epoch;
pub mod notify;
pub mod rcu;

pub use epoch::{EpochDomain, EpochReclaim, EpochStats, ReadGuard};
pub use notify::{EventNotifier, NotificationStats};
pub use rcu::DriverSlot;
