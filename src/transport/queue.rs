//! In-process bounded message queue transport
//!
//! A [`MessageQueue`] is shared by a send endpoint and a receive endpoint.
//! Wakeups are edge-triggered: the receiver is woken when the queue goes from
//! empty to non-empty, the sender when it goes from full to non-full, and both
//! once when the handshake publishes the queue limits.

use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, trace};
use parking_lot::Mutex;

use super::traits::{Capabilities, Transport, TransportError, TransportResult};
use crate::{
    buffers::{BufferRange, BufferRangeMut, SegmentedBuffer},
    channel::{ChannelLimits, ChannelWaker},
    error::{NeuronError, Result},
};

/// Configuration of a message queue pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Messages the queue holds before send reports `WouldBlock`
    pub depth: usize,
    /// Largest message accepted
    pub max_message_size: usize,
    /// Advertise the vectored call set instead of the scalar one
    pub vectored: bool,
    /// Refuse traffic until `complete_handshake` is called
    pub require_handshake: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            max_message_size: 4096,
            vectored: false,
            require_handshake: false,
        }
    }
}

impl QueueConfig {
    /// Set queue depth
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Set maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Use vectored calls
    pub fn with_vectored(mut self, vectored: bool) -> Self {
        self.vectored = vectored;
        self
    }

    /// Hold traffic until the handshake completes
    pub fn with_handshake(mut self, required: bool) -> Self {
        self.require_handshake = required;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(NeuronError::invalid_parameter(
                "depth",
                "Queue depth cannot be zero",
            ));
        }
        if self.max_message_size == 0 {
            return Err(NeuronError::invalid_parameter(
                "max_message_size",
                "Maximum message size cannot be zero",
            ));
        }
        Ok(())
    }

    /// Limits published by the handshake
    pub fn limits(&self) -> ChannelLimits {
        ChannelLimits::new(self.max_message_size, self.depth)
    }
}

/// Which side of the queue an endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Sender,
    Receiver,
}

/// Queue traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Empty to non-empty transitions signalled to the receiver
    pub receiver_wakeups: u64,
    /// Full to non-full transitions signalled to the sender
    pub sender_wakeups: u64,
    /// Messages currently queued
    pub queued: usize,
}

/// Bounded FIFO shared by two endpoints
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    messages: Mutex<VecDeque<Vec<u8>>>,
    ready: AtomicBool,
    handshake_done: AtomicBool,
    sender: Mutex<Option<ChannelWaker>>,
    receiver: Mutex<Option<ChannelWaker>>,
    sent: AtomicU64,
    received: AtomicU64,
    receiver_wakeups: AtomicU64,
    sender_wakeups: AtomicU64,
}

impl MessageQueue {
    /// Create a queue and its send and receive endpoints
    ///
    /// An invalid configuration is clamped to a one-slot, one-byte queue;
    /// call [`QueueConfig::validate`] first to reject it instead.
    pub fn pair(config: QueueConfig) -> (Arc<QueueEndpoint>, Arc<QueueEndpoint>) {
        let mut config = config;
        config.depth = config.depth.max(1);
        config.max_message_size = config.max_message_size.max(1);

        let queue = Arc::new(Self {
            ready: AtomicBool::new(!config.require_handshake),
            messages: Mutex::new(VecDeque::with_capacity(config.depth)),
            config,
            handshake_done: AtomicBool::new(false),
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            receiver_wakeups: AtomicU64::new(0),
            sender_wakeups: AtomicU64::new(0),
        });

        let sender = Arc::new(QueueEndpoint {
            queue: queue.clone(),
            role: QueueRole::Sender,
        });
        let receiver = Arc::new(QueueEndpoint {
            queue,
            role: QueueRole::Receiver,
        });
        (sender, receiver)
    }

    /// Get configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Check if no message is queued
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Get traffic counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            receiver_wakeups: self.receiver_wakeups.load(Ordering::Relaxed),
            sender_wakeups: self.sender_wakeups.load(Ordering::Relaxed),
            queued: self.len(),
        }
    }

    /// Publish the queue limits to both channels and wake each once
    ///
    /// Only the first call has an effect; returns whether it was this one.
    pub fn complete_handshake(&self) -> bool {
        if self.handshake_done.swap(true, Ordering::AcqRel) {
            return false;
        }

        let limits = self.config.limits();
        for waker in [&self.sender, &self.receiver] {
            if let Some(waker) = waker.lock().as_ref() {
                waker.publish_limits(limits);
            }
        }
        self.ready.store(true, Ordering::Release);
        debug!(
            "queue handshake complete: max {} bytes, depth {}",
            limits.max_message_size, limits.min_queue_depth
        );

        Self::wake(&self.sender, &self.sender_wakeups);
        Self::wake(&self.receiver, &self.receiver_wakeups);
        true
    }

    fn wake(side: &Mutex<Option<ChannelWaker>>, counter: &AtomicU64) {
        let waker = side.lock().clone();
        let Some(waker) = waker else {
            return;
        };

        counter.fetch_add(1, Ordering::Relaxed);
        match waker.wake() {
            Ok(()) => {}
            Err(NeuronError::NotBound) => {
                trace!("queue wakeup for channel {:?} not bound", waker.channel_id());
            }
            Err(err) => {
                debug!("queue wakeup for channel {:?} failed: {}", waker.channel_id(), err);
            }
        }
    }

    fn push(&self, message: Vec<u8>) -> TransportResult<()> {
        if message.is_empty() {
            return Err(TransportError::EmptyMessage);
        }
        if message.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                limit: self.config.max_message_size,
            });
        }
        if !self.ready.load(Ordering::Acquire) {
            return Err(TransportError::NotReady);
        }

        let was_empty = {
            let mut messages = self.messages.lock();
            if messages.len() >= self.config.depth {
                return Err(TransportError::WouldBlock);
            }
            let was_empty = messages.is_empty();
            messages.push_back(message);
            was_empty
        };

        self.sent.fetch_add(1, Ordering::Relaxed);
        if was_empty {
            Self::wake(&self.receiver, &self.receiver_wakeups);
        }
        Ok(())
    }

    fn pop(&self, limit: usize) -> TransportResult<Vec<u8>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(TransportError::NotReady);
        }

        let (message, was_full) = {
            let mut messages = self.messages.lock();
            let was_full = messages.len() >= self.config.depth;
            let message = messages.pop_front().ok_or(TransportError::WouldBlock)?;
            if message.len() > limit {
                let size = message.len();
                messages.push_front(message);
                return Err(TransportError::MessageTooLarge { size, limit });
            }
            (message, was_full)
        };

        self.received.fetch_add(1, Ordering::Relaxed);
        if was_full {
            Self::wake(&self.sender, &self.sender_wakeups);
        }
        Ok(message)
    }
}

/// One side of a [`MessageQueue`], used as a channel transport
#[derive(Debug)]
pub struct QueueEndpoint {
    queue: Arc<MessageQueue>,
    role: QueueRole,
}

impl QueueEndpoint {
    /// Shared queue
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// See [`MessageQueue::complete_handshake`]
    pub fn complete_handshake(&self) -> bool {
        self.queue.complete_handshake()
    }

    fn sending(&self, call: &'static str) -> TransportResult<()> {
        match self.role {
            QueueRole::Sender => Ok(()),
            QueueRole::Receiver => Err(TransportError::Unsupported(call)),
        }
    }

    fn receiving(&self, call: &'static str) -> TransportResult<()> {
        match self.role {
            QueueRole::Receiver => Ok(()),
            QueueRole::Sender => Err(TransportError::Unsupported(call)),
        }
    }
}

impl Transport for QueueEndpoint {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vectored: self.queue.config.vectored,
        }
    }

    fn attach(&self, waker: ChannelWaker) {
        let side = match self.role {
            QueueRole::Sender => &self.queue.sender,
            QueueRole::Receiver => &self.queue.receiver,
        };
        *side.lock() = Some(waker);
    }

    fn send(&self, buffer: &SegmentedBuffer) -> TransportResult<()> {
        self.sending("send")?;
        self.queue.push(buffer.to_vec())
    }

    fn send_vectored(&self, range: BufferRange<'_>) -> TransportResult<()> {
        self.sending("send_vectored")?;
        self.queue.push(range.to_vec())
    }

    fn receive(&self, buffer: &mut SegmentedBuffer) -> TransportResult<NonZeroUsize> {
        self.receiving("receive")?;
        let limit = buffer.len();
        let message = self.queue.pop(limit)?;
        let size = message.len();
        buffer
            .write_at(0, &message)
            .map_err(|_| TransportError::MessageTooLarge { size, limit })?;
        NonZeroUsize::new(size).ok_or(TransportError::EmptyMessage)
    }

    fn receive_vectored(&self, mut range: BufferRangeMut<'_>) -> TransportResult<NonZeroUsize> {
        self.receiving("receive_vectored")?;
        let message = self.queue.pop(range.len())?;
        let size = message.len();
        let limit = range.len();
        range
            .copy_from(&message)
            .map_err(|_| TransportError::MessageTooLarge { size, limit })?;
        NonZeroUsize::new(size).ok_or(TransportError::EmptyMessage)
    }
}
