//! Channel to protocol slot matching
//!
//! A channel fits a slot when the `(kind, direction)` tuples are equal and
//! the protocol's process constraint admits the channel's advertiser.
//! Candidates are scanned linearly: earlier-registered protocols first, then
//! earlier-declared slots.

use std::sync::Arc;

use super::{
    driver::ChannelMatch,
    protocol::{Protocol, ProtocolInner, ProtocolState},
};
use crate::{channel::Channel, config::MatchPolicy};

/// Whether `slot` accepts `channel`, ignoring whether it is filled
pub fn slot_accepts(slot: &ChannelMatch, channel: &Channel, policy: MatchPolicy) -> bool {
    if slot.kind != channel.kind() || slot.direction != channel.direction() {
        return false;
    }

    match (policy, slot.name.as_deref()) {
        (MatchPolicy::ByName, Some(name)) => channel.name() == Some(name),
        _ => true,
    }
}

/// Whether the protocol's process constraint admits `channel`
///
/// A protocol without process names admits every channel; otherwise the
/// channel must name one of them.
pub fn process_admits(process_names: &[String], channel: &Channel) -> bool {
    process_names.is_empty()
        || channel
            .process()
            .map_or(false, |process| process_names.iter().any(|p| p == process))
}

/// First open slot of `protocol` that fits `channel`
pub(crate) fn open_slot(
    protocol: &Protocol,
    inner: &ProtocolInner,
    channel: &Channel,
    policy: MatchPolicy,
) -> Option<usize> {
    if inner.state != ProtocolState::Pending || !process_admits(protocol.process_names(), channel) {
        return None;
    }

    protocol
        .shape()
        .iter()
        .zip(&inner.slots)
        .position(|(slot, filled)| filled.is_none() && slot_accepts(slot, channel, policy))
}

/// First protocol and slot, in registration order, that fits `channel`
pub(crate) fn find_slot<'a>(
    protocols: impl IntoIterator<Item = &'a Arc<Protocol>>,
    channel: &Channel,
    policy: MatchPolicy,
) -> Option<(Arc<Protocol>, usize)> {
    protocols.into_iter().find_map(|protocol| {
        let inner = protocol.lock();
        open_slot(protocol, &inner, channel, policy).map(|slot| (protocol.clone(), slot))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ChannelDescriptor, ChannelKind, Direction},
        protocol::ProtocolConfig,
        sync::EpochDomain,
        transport::{Doorbell, Transport},
    };

    fn channel(descriptor: ChannelDescriptor) -> Arc<Channel> {
        let (_ring, listen) = Doorbell::pair();
        let transport: Arc<dyn Transport> = listen;
        Channel::new(10, descriptor, transport, Arc::new(EpochDomain::new()))
    }

    fn protocol(id: u64, config: ProtocolConfig) -> Arc<Protocol> {
        Arc::new(Protocol::new(id, config, Arc::new(EpochDomain::new())))
    }

    #[test]
    fn test_tuples_must_be_equal() {
        let slot = ChannelMatch::new(ChannelKind::MessageQueue, Direction::Bidirectional);
        let send = channel(ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send));
        let both = channel(ChannelDescriptor::new(
            ChannelKind::MessageQueue,
            Direction::Bidirectional,
        ));

        assert!(!slot_accepts(&slot, &send, MatchPolicy::FirstDeclared));
        assert!(slot_accepts(&slot, &both, MatchPolicy::FirstDeclared));
    }

    #[test]
    fn test_by_name_policy() {
        let slot = ChannelMatch::named(ChannelKind::Notification, Direction::Receive, "irq");
        let anonymous = channel(ChannelDescriptor::new(
            ChannelKind::Notification,
            Direction::Receive,
        ));
        let named = channel(
            ChannelDescriptor::new(ChannelKind::Notification, Direction::Receive).with_name("irq"),
        );

        assert!(slot_accepts(&slot, &anonymous, MatchPolicy::FirstDeclared));
        assert!(!slot_accepts(&slot, &anonymous, MatchPolicy::ByName));
        assert!(slot_accepts(&slot, &named, MatchPolicy::ByName));
    }

    #[test]
    fn test_process_constraint() {
        let plain = channel(ChannelDescriptor::new(
            ChannelKind::Notification,
            Direction::Receive,
        ));
        let from_vm = channel(
            ChannelDescriptor::new(ChannelKind::Notification, Direction::Receive)
                .with_process("vm1"),
        );

        assert!(process_admits(&[], &plain));
        assert!(!process_admits(&["vm1".to_string()], &plain));
        assert!(process_admits(&["vm1".to_string()], &from_vm));
        assert!(!process_admits(&["vm2".to_string()], &from_vm));
    }

    #[test]
    fn test_first_declared_wins() {
        let shape = || {
            ProtocolConfig::new("p")
                .with_channel(ChannelKind::MessageQueue, Direction::Send)
                .with_channel(ChannelKind::Notification, Direction::Receive)
                .with_channel(ChannelKind::Notification, Direction::Receive)
        };
        let first = protocol(1, shape());
        let second = protocol(2, shape());
        let bell = channel(ChannelDescriptor::new(
            ChannelKind::Notification,
            Direction::Receive,
        ));

        let (winner, slot) = find_slot([&first, &second], &bell, MatchPolicy::FirstDeclared).unwrap();
        assert_eq!(winner.id(), 1);
        assert_eq!(slot, 1);
    }
}
