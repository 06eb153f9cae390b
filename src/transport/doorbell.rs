//! In-process notification bitmask transport

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use log::trace;
use parking_lot::Mutex;

use super::traits::{Transport, TransportError, TransportResult};
use crate::{channel::ChannelWaker, error::NeuronError};

/// 32-bit doorbell shared by a ringing side and a listening side
///
/// Ringing ORs bits into the mask and wakes the listener when at least one
/// of them was not already pending. The listener reads and clears the mask;
/// the wakeup itself carries no payload.
#[derive(Debug, Default)]
pub struct Doorbell {
    pending: AtomicU32,
    listener: Mutex<Option<ChannelWaker>>,
    rings: AtomicU64,
    wakeups: AtomicU64,
}

impl Doorbell {
    /// Create a doorbell and its ringing and listening endpoints
    pub fn pair() -> (Arc<DoorbellEndpoint>, Arc<DoorbellEndpoint>) {
        let bell = Arc::new(Self::default());
        (
            Arc::new(DoorbellEndpoint {
                bell: bell.clone(),
                listening: false,
            }),
            Arc::new(DoorbellEndpoint {
                bell,
                listening: true,
            }),
        )
    }

    /// Bits raised and not yet read
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of `ring` calls and wakeups raised, in that order
    pub fn counts(&self) -> (u64, u64) {
        (
            self.rings.load(Ordering::Relaxed),
            self.wakeups.load(Ordering::Relaxed),
        )
    }

    fn ring(&self, bits: u32) {
        self.rings.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.fetch_or(bits, Ordering::AcqRel);
        if bits & !previous == 0 {
            return;
        }

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = listener.wake() {
                if !matches!(err, NeuronError::NotBound) {
                    trace!("doorbell wakeup failed: {}", err);
                }
            }
        }
    }

    fn take(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}

/// One side of a [`Doorbell`]
#[derive(Debug)]
pub struct DoorbellEndpoint {
    bell: Arc<Doorbell>,
    listening: bool,
}

impl DoorbellEndpoint {
    /// Shared doorbell
    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.bell
    }
}

impl Transport for DoorbellEndpoint {
    fn attach(&self, waker: ChannelWaker) {
        // Ringing channels never receive wakeups
        if self.listening {
            *self.bell.listener.lock() = Some(waker);
        }
    }

    fn send_notify(&self, bits: u32) -> TransportResult<()> {
        if self.listening {
            return Err(TransportError::Unsupported("send_notify"));
        }
        self.bell.ring(bits);
        Ok(())
    }

    fn receive_notify(&self) -> TransportResult<u32> {
        if !self.listening {
            return Err(TransportError::Unsupported("receive_notify"));
        }
        Ok(self.bell.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_accumulate_until_read() {
        let (ring, listen) = Doorbell::pair();
        ring.send_notify(0b01).unwrap();
        ring.send_notify(0b10).unwrap();
        assert_eq!(listen.doorbell().pending(), 0b11);

        assert_eq!(listen.receive_notify().unwrap(), 0b11);
        assert_eq!(listen.receive_notify().unwrap(), 0);

        assert!(ring.receive_notify().is_err());
        assert!(listen.send_notify(1).is_err());
    }
}
