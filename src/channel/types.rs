//! Channel kinds, directions and descriptors

use std::fmt;

use serde::{Deserialize, Serialize};

/// Registry-wide channel identifier
pub type ChannelId = u64;

/// Transport mechanism of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Bounded queue of discrete messages
    MessageQueue,
    /// 32-bit doorbell bitmask
    Notification,
    /// Memory region visible to both sides
    SharedMemory,
}

impl ChannelKind {
    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::MessageQueue => "queue",
            ChannelKind::Notification => "notification",
            ChannelKind::SharedMemory => "shared_memory",
        }
    }

    /// Whether transports of this kind raise wakeups at all
    pub fn uses_wakeups(&self) -> bool {
        !matches!(self, ChannelKind::SharedMemory)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Data direction of a channel, seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Send,
    Receive,
    /// Union of `Send` and `Receive`
    Bidirectional,
}

impl Direction {
    const SEND: u8 = 1 << 0;
    const RECEIVE: u8 = 1 << 1;

    /// Direction as a bit set
    pub fn bits(&self) -> u8 {
        match self {
            Direction::Send => Self::SEND,
            Direction::Receive => Self::RECEIVE,
            Direction::Bidirectional => Self::SEND | Self::RECEIVE,
        }
    }

    /// Whether data may be sent in this direction
    pub fn can_send(&self) -> bool {
        self.bits() & Self::SEND != 0
    }

    /// Whether data may be received in this direction
    pub fn can_receive(&self) -> bool {
        self.bits() & Self::RECEIVE != 0
    }

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
            Direction::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Advisory lower bounds guaranteed by a message queue transport
///
/// Both are zero until the handshake with the peer has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Largest message the transport guarantees to carry
    pub max_message_size: usize,
    /// Number of messages the queue guarantees to hold
    pub min_queue_depth: usize,
}

impl ChannelLimits {
    /// Create limits
    pub fn new(max_message_size: usize, min_queue_depth: usize) -> Self {
        Self {
            max_message_size,
            min_queue_depth,
        }
    }

    /// Whether the handshake has published the limits
    pub fn is_known(&self) -> bool {
        self.max_message_size != 0 && self.min_queue_depth != 0
    }
}

/// What a transport advertises when it registers a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub kind: ChannelKind,
    pub direction: Direction,
    pub limits: ChannelLimits,
    /// Optional name, matched against named protocol slots
    pub name: Option<String>,
    /// Identity of the advertising component
    pub process: Option<String>,
}

impl ChannelDescriptor {
    /// Describe a channel of the given kind and direction
    pub fn new(kind: ChannelKind, direction: Direction) -> Self {
        Self {
            kind,
            direction,
            limits: ChannelLimits::default(),
            name: None,
            process: None,
        }
    }

    /// Set advisory limits
    pub fn with_limits(mut self, limits: ChannelLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the channel name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the advertising process
    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.process = Some(process.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_bits() {
        assert!(Direction::Bidirectional.can_send());
        assert!(Direction::Bidirectional.can_receive());
        assert!(!Direction::Send.can_receive());
        assert!(!Direction::Receive.can_send());
        assert_eq!(
            Direction::Bidirectional.bits(),
            Direction::Send.bits() | Direction::Receive.bits()
        );
    }

    #[test]
    fn test_limits_known_after_handshake() {
        assert!(!ChannelLimits::default().is_known());
        assert!(!ChannelLimits::new(256, 0).is_known());
        assert!(ChannelLimits::new(256, 8).is_known());
    }
}
