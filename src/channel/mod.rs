//! Link-layer channels
//!
//! A channel is one endpoint of a transport, of one kind and direction. It is
//! claimed by at most one protocol slot and reaches that protocol's driver
//! through non-blocking wakeups.

#[allow(clippy::module_inception)]
pub mod channel;
pub mod types;

pub use channel::{Channel, ChannelBinding, ChannelWaker};
pub use types::{ChannelDescriptor, ChannelId, ChannelKind, ChannelLimits, Direction};
