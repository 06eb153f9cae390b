//! Protocols, their drivers and channel matching

pub mod driver;
pub mod matcher;
#[allow(clippy::module_inception)]
pub mod protocol;
pub mod signal;

pub use driver::{driver_matches, ApplicationDriver, ChannelMatch, ProtocolDriver, ProtocolId};
pub use matcher::{process_admits, slot_accepts};
pub use protocol::{Protocol, ProtocolConfig, ProtocolState};
pub use signal::{Signal, SignalDriver, SignalStats};
