//! Registered channel endpoints

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use log::trace;
use parking_lot::Mutex;

use super::types::{ChannelDescriptor, ChannelId, ChannelKind, ChannelLimits, Direction};
use crate::{
    buffers::SegmentedBuffer,
    error::{NeuronError, Result},
    protocol::{ProtocolDriver, ProtocolId},
    sync::{DriverSlot, EpochDomain},
    transport::{SharedRegion, Transport},
    wakeup::{self, ChannelRoute, WakeupCounts, WakeupStats},
};

/// Where a channel is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub protocol: ProtocolId,
    /// Slot index within the protocol, unique among its channels
    pub identity: u32,
}

/// A link-layer endpoint of one kind and direction
///
/// The binding is set when a protocol claims the channel and does not change
/// until that protocol releases it. The protocol driver is published through
/// an RCU slot so wakeups can read it from any thread.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    direction: Direction,
    name: Option<String>,
    process: Option<String>,
    max_message_size: AtomicUsize,
    min_queue_depth: AtomicUsize,
    binding: Mutex<Option<ChannelBinding>>,
    route: DriverSlot<ChannelRoute>,
    transport: Arc<dyn Transport>,
    wakeups: WakeupStats,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        descriptor: ChannelDescriptor,
        transport: Arc<dyn Transport>,
        domain: Arc<EpochDomain>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            id,
            kind: descriptor.kind,
            direction: descriptor.direction,
            name: descriptor.name,
            process: descriptor.process,
            max_message_size: AtomicUsize::new(descriptor.limits.max_message_size),
            min_queue_depth: AtomicUsize::new(descriptor.limits.min_queue_depth),
            binding: Mutex::new(None),
            route: DriverSlot::new(domain),
            transport,
            wakeups: WakeupStats::default(),
        });

        channel.transport.attach(ChannelWaker {
            channel: Arc::downgrade(&channel),
        });
        channel
    }

    /// Registry-wide id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Component that advertised the channel
    pub fn process(&self) -> Option<&str> {
        self.process.as_deref()
    }

    /// Current advisory limits
    pub fn limits(&self) -> ChannelLimits {
        ChannelLimits {
            max_message_size: self.max_message_size.load(Ordering::Acquire),
            min_queue_depth: self.min_queue_depth.load(Ordering::Acquire),
        }
    }

    fn publish_limits(&self, limits: ChannelLimits) {
        self.max_message_size
            .store(limits.max_message_size, Ordering::Release);
        self.min_queue_depth
            .store(limits.min_queue_depth, Ordering::Release);
    }

    /// Protocol and slot this channel fills, if claimed
    pub fn binding(&self) -> Option<ChannelBinding> {
        *self.binding.lock()
    }

    /// Check if a protocol has claimed this channel
    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    pub(crate) fn set_binding(&self, binding: Option<ChannelBinding>) {
        *self.binding.lock() = binding;
    }

    /// Protocol driver currently serving this channel
    pub fn driver(&self) -> Option<Arc<dyn ProtocolDriver>> {
        self.route.load().map(|route| route.driver.clone())
    }

    /// Check if a protocol driver is attached
    pub fn has_driver(&self) -> bool {
        self.route.is_set()
    }

    pub(crate) fn attach_driver(&self, route: ChannelRoute) {
        self.route.replace(Some(Arc::new(route)));
    }

    pub(crate) fn detach_driver(&self) {
        self.route.clear();
    }

    /// Tell the protocol driver this channel is ready
    ///
    /// Returns `NotBound` while no driver serves the channel.
    pub fn wakeup(&self) -> Result<()> {
        wakeup::channel_wakeup(&self.route, &self.wakeups)
    }

    /// Wakeup counters for this channel
    pub fn wakeup_stats(&self) -> WakeupCounts {
        self.wakeups.snapshot()
    }

    /// Transport behind this channel
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn require(&self, kind: ChannelKind, allowed: bool, operation: &str) -> Result<()> {
        if self.kind != kind || !allowed {
            return Err(NeuronError::unsupported(format!(
                "{} on {} {} channel {}",
                operation, self.direction, self.kind, self.id
            )));
        }
        Ok(())
    }

    /// Send the whole buffer as one message
    pub fn send(&self, buffer: &SegmentedBuffer) -> Result<()> {
        self.require(ChannelKind::MessageQueue, self.direction.can_send(), "send")?;
        trace!("channel {} send {} bytes", self.id, buffer.len());

        if self.transport.capabilities().vectored {
            self.transport.send_vectored(buffer.range(0, buffer.len())?)?;
        } else {
            self.transport.send(buffer)?;
        }
        Ok(())
    }

    /// Receive one message into `buffer`, which is resized to the message
    pub fn receive(&self, buffer: &mut SegmentedBuffer) -> Result<NonZeroUsize> {
        self.require(
            ChannelKind::MessageQueue,
            self.direction.can_receive(),
            "receive",
        )?;

        // Offer the full capacity to the transport
        let entry_len = buffer.len();
        buffer.set_len(buffer.capacity());
        let received = if self.transport.capabilities().vectored {
            let len = buffer.len();
            self.transport.receive_vectored(buffer.range_mut(0, len)?)
        } else {
            self.transport.receive(buffer)
        };

        match received {
            Ok(size) => {
                buffer.set_len(size.get());
                trace!("channel {} received {} bytes", self.id, size);
                Ok(size)
            }
            Err(err) => {
                buffer.set_len(entry_len);
                Err(err.into())
            }
        }
    }

    /// Raise doorbell bits at the peer
    pub fn send_notify(&self, bits: u32) -> Result<()> {
        self.require(
            ChannelKind::Notification,
            self.direction.can_send(),
            "send_notify",
        )?;
        Ok(self.transport.send_notify(bits)?)
    }

    /// Read and clear pending doorbell bits
    pub fn receive_notify(&self) -> Result<u32> {
        self.require(
            ChannelKind::Notification,
            self.direction.can_receive(),
            "receive_notify",
        )?;
        Ok(self.transport.receive_notify()?)
    }

    /// Memory of a shared-memory channel
    pub fn region(&self) -> Result<&SharedRegion> {
        self.require(ChannelKind::SharedMemory, true, "region")?;
        self.transport
            .region()
            .ok_or_else(|| NeuronError::unsupported("region on transport without memory"))
    }
}

/// Handle a transport uses to reach its channel
///
/// Holds a weak reference: a transport never keeps its channel alive.
#[derive(Debug, Clone)]
pub struct ChannelWaker {
    channel: Weak<Channel>,
}

impl ChannelWaker {
    /// Raise a wakeup on the channel
    ///
    /// `NotBound` when nobody is listening or the channel is gone.
    pub fn wake(&self) -> Result<()> {
        match self.channel.upgrade() {
            Some(channel) => channel.wakeup(),
            None => Err(NeuronError::NotBound),
        }
    }

    /// Publish limits negotiated with the peer
    pub fn publish_limits(&self, limits: ChannelLimits) {
        if let Some(channel) = self.channel.upgrade() {
            channel.publish_limits(limits);
        }
    }

    /// Id of the channel, if it still exists
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel.upgrade().map(|channel| channel.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffers::{AllocFlags, SegmentAllocator},
        config::SegmentConfig,
        transport::{Doorbell, MessageQueue, QueueConfig},
    };

    fn channel(descriptor: ChannelDescriptor, transport: Arc<dyn Transport>) -> Arc<Channel> {
        Channel::new(1, descriptor, transport, Arc::new(EpochDomain::new()))
    }

    #[test]
    fn test_unbound_channel_wakeup() {
        let (tx, _rx) = MessageQueue::pair(QueueConfig::default());
        let channel = channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send),
            tx,
        );

        assert!(!channel.is_bound());
        assert!(channel.wakeup().unwrap_err().is_not_bound());
        assert_eq!(channel.wakeup_stats().not_bound, 1);
    }

    #[test]
    fn test_direction_is_enforced() {
        let (tx, rx) = MessageQueue::pair(QueueConfig::default());
        let send = channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send),
            tx,
        );
        let receive = channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Receive),
            rx,
        );
        let allocator = SegmentAllocator::heap(SegmentConfig::default()).unwrap();

        let mut buffer = allocator.allocate(16, AllocFlags::Atomic).unwrap();
        assert!(matches!(
            send.receive(&mut buffer),
            Err(NeuronError::Unsupported { .. })
        ));
        assert!(matches!(
            receive.send(&buffer),
            Err(NeuronError::Unsupported { .. })
        ));
        assert!(matches!(
            send.send_notify(1),
            Err(NeuronError::Unsupported { .. })
        ));

        buffer.fill_from(b"ping").unwrap();
        send.send(&buffer).unwrap();
        let mut inbox = allocator.allocate(64, AllocFlags::Atomic).unwrap();
        assert_eq!(receive.receive(&mut inbox).unwrap().get(), 4);
        assert_eq!(inbox.to_vec(), b"ping".to_vec());
    }

    #[test]
    fn test_failed_receive_keeps_buffer_length() {
        let (_tx, rx) = MessageQueue::pair(QueueConfig::default());
        let receive = channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Receive),
            rx,
        );
        let allocator = SegmentAllocator::heap(SegmentConfig::default()).unwrap();

        let mut inbox = allocator.allocate(64, AllocFlags::Atomic).unwrap();
        inbox.fill_from(b"stale").unwrap();
        assert!(receive.receive(&mut inbox).is_err());
        assert_eq!(inbox.len(), 5);
        assert_eq!(inbox.to_vec(), b"stale".to_vec());
    }

    #[test]
    fn test_doorbell_channel() {
        let (ring, bell) = Doorbell::pair();
        let sender = channel(
            ChannelDescriptor::new(ChannelKind::Notification, Direction::Send),
            ring,
        );
        let receiver = channel(
            ChannelDescriptor::new(ChannelKind::Notification, Direction::Receive),
            bell,
        );

        sender.send_notify(0b101).unwrap();
        assert_eq!(receiver.receive_notify().unwrap(), 0b101);
        assert_eq!(receiver.receive_notify().unwrap(), 0);
    }

    #[test]
    fn test_waker_does_not_keep_channel_alive() {
        let (tx, _rx) = MessageQueue::pair(QueueConfig::default());
        let channel = channel(
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send),
            tx,
        );
        let waker = ChannelWaker {
            channel: Arc::downgrade(&channel),
        };
        assert_eq!(waker.channel_id(), Some(1));

        drop(channel);
        assert!(waker.wake().unwrap_err().is_not_bound());
        assert_eq!(waker.channel_id(), None);
    }
}
