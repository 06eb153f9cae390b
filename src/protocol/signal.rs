//! Ready-made protocol driver that hands wakeups to worker threads
//!
//! Handlers only touch atomics: they record the signal in a bounded
//! lock-free ring, mark the channel in a pending bitmask and poke an
//! [`EventNotifier`]. A worker waits on the notifier and drains the ring.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use log::debug;
use parking_lot::Mutex;

use super::{
    driver::{ChannelMatch, ProtocolDriver, ProtocolId},
    protocol::Protocol,
};
use crate::{
    error::{NeuronError, Result},
    sync::EventNotifier,
};

/// Default number of signals buffered before new ones are dropped
pub const DEFAULT_SIGNAL_CAPACITY: usize = 256;

/// Something a worker should look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Channel `channel` of `protocol` became ready
    Channel { protocol: ProtocolId, channel: u32 },
    /// The application on `protocol` raised `event`
    Application { protocol: ProtocolId, event: u32 },
}

impl Signal {
    const CHANNEL: u64 = 0;
    const APPLICATION: u64 = 1;

    fn pack(&self) -> (u64, u64) {
        match *self {
            Signal::Channel { protocol, channel } => {
                (protocol, (Self::CHANNEL << 32) | channel as u64)
            }
            Signal::Application { protocol, event } => {
                (protocol, (Self::APPLICATION << 32) | event as u64)
            }
        }
    }

    fn unpack(protocol: u64, payload: u64) -> Self {
        let id = payload as u32;
        if payload >> 32 == Self::APPLICATION {
            Signal::Application { protocol, event: id }
        } else {
            Signal::Channel {
                protocol,
                channel: id,
            }
        }
    }
}

#[derive(Debug)]
struct Cell {
    sequence: AtomicUsize,
    protocol: AtomicU64,
    payload: AtomicU64,
}

/// Bounded multi-producer multi-consumer signal queue
///
/// Each cell carries a sequence number telling producers and consumers whose
/// turn it is, so neither side ever waits for the other.
#[derive(Debug)]
struct SignalRing {
    cells: Box<[Cell]>,
    mask: usize,
    enqueue: AtomicUsize,
    dequeue: AtomicUsize,
}

impl SignalRing {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let cells = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                protocol: AtomicU64::new(0),
                payload: AtomicU64::new(0),
            })
            .collect();

        Self {
            cells,
            mask: capacity - 1,
            enqueue: AtomicUsize::new(0),
            dequeue: AtomicUsize::new(0),
        }
    }

    fn push(&self, signal: Signal) -> bool {
        let mut pos = self.enqueue.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let lag = sequence as isize - pos as isize;

            if lag == 0 {
                match self.enqueue.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let (protocol, payload) = signal.pack();
                        cell.protocol.store(protocol, Ordering::Relaxed);
                        cell.payload.store(payload, Ordering::Relaxed);
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return false;
            } else {
                pos = self.enqueue.load(Ordering::Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<Signal> {
        let mut pos = self.dequeue.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let lag = sequence as isize - pos.wrapping_add(1) as isize;

            if lag == 0 {
                match self.dequeue.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let protocol = cell.protocol.load(Ordering::Relaxed);
                        let payload = cell.payload.load(Ordering::Relaxed);
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(Signal::unpack(protocol, payload));
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.dequeue.load(Ordering::Relaxed);
            }
        }
    }
}

/// Counters of a [`SignalDriver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalStats {
    pub channel_wakeups: u64,
    pub app_events: u64,
    /// Signals lost because the ring was full
    pub dropped: u64,
    /// Signals whose worker wakeup could not be raised
    pub notify_failures: u64,
}

/// Protocol driver that defers all work to a worker thread
#[derive(Debug)]
pub struct SignalDriver {
    name: String,
    shape: Vec<ChannelMatch>,
    processes: Vec<String>,
    ring: SignalRing,
    /// Bit `n % 64` set when channel identity `n` signalled
    pending_channels: AtomicU64,
    notifier: EventNotifier,
    protocols: Mutex<Vec<Weak<Protocol>>>,
    channel_wakeups: AtomicU64,
    app_events: AtomicU64,
    dropped: AtomicU64,
    notify_failures: AtomicU64,
}

impl SignalDriver {
    /// Create a driver serving protocols of the given shape
    pub fn new(name: impl Into<String>, shape: Vec<ChannelMatch>) -> Result<Self> {
        Self::with_capacity(name, shape, DEFAULT_SIGNAL_CAPACITY)
    }

    /// Create a driver buffering up to `capacity` signals
    pub fn with_capacity(
        name: impl Into<String>,
        shape: Vec<ChannelMatch>,
        capacity: usize,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            shape,
            processes: Vec::new(),
            ring: SignalRing::new(capacity),
            pending_channels: AtomicU64::new(0),
            notifier: EventNotifier::new()?,
            protocols: Mutex::new(Vec::new()),
            channel_wakeups: AtomicU64::new(0),
            app_events: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
        })
    }

    /// Declare compatible components
    pub fn with_processes(mut self, processes: Vec<String>) -> Self {
        self.processes = processes;
        self
    }

    fn signal(&self, signal: Signal) {
        if !self.ring.push(signal) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // The signal stays queued; the worker finds it on its next wakeup
        if let Err(err) = self.notifier.notify() {
            self.notify_failures.fetch_add(1, Ordering::Relaxed);
            debug!("{} failed to wake worker for {:?}: {}", self.name, signal, err);
        }
    }

    /// Wait until a signal arrives or the timeout elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.notifier.wait(timeout)
    }

    /// Take every buffered signal, oldest first
    pub fn drain(&self) -> Vec<Signal> {
        std::iter::from_fn(|| self.ring.pop()).collect()
    }

    /// Read and clear the pending channel bitmask
    pub fn take_pending_channels(&self) -> u64 {
        self.pending_channels.swap(0, Ordering::AcqRel)
    }

    /// Protocols currently served
    pub fn protocols(&self) -> Vec<Arc<Protocol>> {
        self.protocols.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Notifier a worker can poll on
    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Get signal counters
    pub fn stats(&self) -> SignalStats {
        SignalStats {
            channel_wakeups: self.channel_wakeups.load(Ordering::Relaxed),
            app_events: self.app_events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
        }
    }
}

impl ProtocolDriver for SignalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> &[ChannelMatch] {
        &self.shape
    }

    fn processes(&self) -> &[String] {
        &self.processes
    }

    fn probe(&self, protocol: &Arc<Protocol>) -> Result<()> {
        let mut protocols = self.protocols.lock();
        if protocols
            .iter()
            .filter_map(Weak::upgrade)
            .any(|p| p.id() == protocol.id())
        {
            return Err(NeuronError::duplicate(format!(
                "protocol {} already served by {}",
                protocol.id(),
                self.name
            )));
        }
        debug!("{} serving protocol {} ({})", self.name, protocol.id(), protocol.name());
        protocols.push(Arc::downgrade(protocol));
        Ok(())
    }

    fn remove(&self, protocol: &Protocol) {
        debug!("{} released protocol {}", self.name, protocol.id());
        self.protocols
            .lock()
            .retain(|p| p.upgrade().map_or(false, |p| p.id() != protocol.id()));
    }

    fn channel_wakeup(&self, protocol: ProtocolId, channel: u32) -> Result<()> {
        self.channel_wakeups.fetch_add(1, Ordering::Relaxed);
        self.pending_channels
            .fetch_or(1 << (channel % 64), Ordering::AcqRel);
        self.signal(Signal::Channel { protocol, channel });
        Ok(())
    }

    fn app_wakeup(&self, protocol: ProtocolId, event: u32) -> Result<()> {
        self.app_events.fetch_add(1, Ordering::Relaxed);
        self.signal(Signal::Application { protocol, event });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ring_is_fifo_and_bounded() {
        let ring = SignalRing::new(4);
        for event in 0..4 {
            assert!(ring.push(Signal::Application { protocol: 1, event }));
        }
        assert!(!ring.push(Signal::Channel {
            protocol: 1,
            channel: 0
        }));

        for event in 0..4 {
            assert_eq!(ring.pop(), Some(Signal::Application { protocol: 1, event }));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_ring_concurrent_producers() {
        let ring = Arc::new(SignalRing::new(1024));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for channel in 0..200 {
                        assert!(ring.push(Signal::Channel {
                            protocol: t,
                            channel,
                        }));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = 0;
        while ring.pop().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 800);
    }

    #[test]
    fn test_handlers_signal_worker() {
        let driver = SignalDriver::with_capacity("sig", Vec::new(), 2).unwrap();
        driver.channel_wakeup(7, 1).unwrap();
        driver.channel_wakeup(7, 3).unwrap();
        driver.app_wakeup(7, 42).unwrap();

        assert!(driver.wait(Some(Duration::from_millis(100))).unwrap());
        assert_eq!(driver.take_pending_channels(), 0b1010);
        assert_eq!(
            driver.drain(),
            vec![
                Signal::Channel {
                    protocol: 7,
                    channel: 1
                },
                Signal::Channel {
                    protocol: 7,
                    channel: 3
                },
            ]
        );

        let stats = driver.stats();
        assert_eq!(stats.channel_wakeups, 2);
        assert_eq!(stats.app_events, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_dropped_signal_still_wakes_worker() {
        let driver = SignalDriver::with_capacity("sig", Vec::new(), 1).unwrap();
        driver.app_wakeup(3, 1).unwrap();
        assert!(driver.wait(Some(Duration::from_millis(100))).unwrap());
        assert_eq!(driver.drain().len(), 1);

        driver.app_wakeup(3, 2).unwrap();
        driver.app_wakeup(3, 3).unwrap();
        assert!(driver.wait(Some(Duration::from_millis(100))).unwrap());
        assert_eq!(driver.drain(), vec![Signal::Application { protocol: 3, event: 2 }]);

        let stats = driver.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.notify_failures, 0);
    }
}
