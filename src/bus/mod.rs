//! Component registry and its statistics

pub mod manager;
pub mod stats;

pub use manager::Bus;
pub use stats::{BindingCounters, BusStats};
