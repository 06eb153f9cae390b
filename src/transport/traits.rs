//! Capability interface implemented by channel transports

use std::num::NonZeroUsize;

use crate::{
    buffers::{BufferRange, BufferRangeMut, SegmentedBuffer},
    channel::ChannelWaker,
};

use super::shm::SharedRegion;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures reported by a transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Queue full on send, or empty on receive
    #[error("operation would block")]
    WouldBlock,

    /// The transport does not implement this call
    #[error("transport does not support {0}")]
    Unsupported(&'static str),

    /// Zero-length messages cannot be queued
    #[error("empty message")]
    EmptyMessage,

    /// The message does not fit the transport or the destination buffer
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// The peer endpoint is gone
    #[error("peer disconnected")]
    Disconnected,

    /// Handshake with the peer has not completed
    #[error("handshake not complete")]
    NotReady,

    /// Underlying OS failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a transport supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Use `send_vectored`/`receive_vectored` instead of the scalar calls
    pub vectored: bool,
}

/// Per-channel data path
///
/// Every call has a default that reports `Unsupported`, so a transport only
/// implements what its channel kind needs. Exactly one of the scalar and
/// vectored message calls is used, selected by [`Capabilities::vectored`].
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Supported call set
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once when the channel is registered
    ///
    /// The waker is how the transport raises wakeups and publishes the limits
    /// negotiated with its peer.
    fn attach(&self, _waker: ChannelWaker) {}

    /// Queue the whole buffer as one message
    fn send(&self, _buffer: &SegmentedBuffer) -> TransportResult<()> {
        Err(TransportError::Unsupported("send"))
    }

    /// Queue a window of a buffer as one message
    fn send_vectored(&self, _range: BufferRange<'_>) -> TransportResult<()> {
        Err(TransportError::Unsupported("send_vectored"))
    }

    /// Dequeue one message into the start of `buffer`
    ///
    /// A message never has zero bytes.
    fn receive(&self, _buffer: &mut SegmentedBuffer) -> TransportResult<NonZeroUsize> {
        Err(TransportError::Unsupported("receive"))
    }

    /// Dequeue one message into a window of a buffer
    fn receive_vectored(&self, _range: BufferRangeMut<'_>) -> TransportResult<NonZeroUsize> {
        Err(TransportError::Unsupported("receive_vectored"))
    }

    /// Raise doorbell bits at the peer
    fn send_notify(&self, _bits: u32) -> TransportResult<()> {
        Err(TransportError::Unsupported("send_notify"))
    }

    /// Read and clear pending doorbell bits
    fn receive_notify(&self) -> TransportResult<u32> {
        Err(TransportError::Unsupported("receive_notify"))
    }

    /// Memory exposed by a shared-memory transport
    fn region(&self) -> Option<&SharedRegion> {
        None
    }
}
