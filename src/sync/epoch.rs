//! Epoch-based grace periods for read-mostly pointers
//!
//! Readers never block and never take a lock: entering a read-side section
//! bumps the in-flight counter that belongs to the parity of the epoch the
//! reader observed, and re-checks that the epoch did not move underneath it.
//! Writers retire old values tagged with the epoch current at retirement and
//! try to advance the epoch; advancing from `e` to `e + 1` is only allowed once
//! the counter for the parity of `e + 1` has drained, so when the epoch reads
//! `e` every reader that started in `e - 2` or earlier has finished. A value
//! retired in epoch `r` is therefore safe to drop once the epoch reaches
//! `r + 2`.
//!
//! Writers never wait for readers either. Reclamation happens whenever
//! [`EpochDomain::try_reclaim`] finds a safe epoch, otherwise retired values
//! simply stay pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Epoch number type for strong typing
pub type EpochNumber = u64;

/// Special epoch values
pub mod epoch {
    use super::EpochNumber;

    /// Initial epoch number
    pub const INITIAL: EpochNumber = 0;
    /// Number of advances after which a retired value is unreachable
    pub const GRACE: EpochNumber = 2;
}

/// Trait for objects that can be reclaimed by the epoch system
pub trait EpochReclaim: Send {
    /// Called when the object can be safely reclaimed
    fn reclaim(&mut self);
}

impl<T: Send + ?Sized> EpochReclaim for Box<T> {
    fn reclaim(&mut self) {
        // Box drops its contents
    }
}

impl<T: Send> EpochReclaim for Vec<T> {
    fn reclaim(&mut self) {
        self.clear();
    }
}

/// Grace-period domain shared by every driver slot of a bus
#[derive(Debug)]
pub struct EpochDomain {
    /// Current global epoch
    global_epoch: AtomicU64,
    /// In-flight readers, indexed by epoch parity
    readers: [AtomicUsize; 2],
    /// Pending reclamations organized by epoch
    pending_reclaims: Mutex<HashMap<EpochNumber, Vec<Box<dyn EpochReclaim>>>>,
    /// Objects reclaimed so far
    reclaimed: AtomicU64,
}

impl std::fmt::Debug for dyn EpochReclaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EpochReclaim")
    }
}

impl EpochDomain {
    /// Create a new grace-period domain
    pub fn new() -> Self {
        Self {
            global_epoch: AtomicU64::new(epoch::INITIAL),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            pending_reclaims: Mutex::new(HashMap::new()),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Enter a read-side section
    ///
    /// Lock-free: the loop only repeats when an epoch advance raced the
    /// announcement.
    pub fn read(&self) -> ReadGuard<'_> {
        loop {
            let epoch = self.global_epoch.load(Ordering::SeqCst);
            let parity = (epoch & 1) as usize;
            self.readers[parity].fetch_add(1, Ordering::SeqCst);

            if self.global_epoch.load(Ordering::SeqCst) == epoch {
                return ReadGuard {
                    domain: self,
                    parity,
                    epoch,
                };
            }

            self.readers[parity].fetch_sub(1, Ordering::SeqCst);
            std::hint::spin_loop();
        }
    }

    /// Get the current global epoch
    pub fn current_epoch(&self) -> EpochNumber {
        self.global_epoch.load(Ordering::SeqCst)
    }

    /// Try to advance the global epoch by one
    ///
    /// Fails without waiting if readers of two epochs ago are still in flight.
    pub fn try_advance(&self) -> bool {
        let current = self.global_epoch.load(Ordering::SeqCst);
        let next = current + 1;

        if self.readers[(next & 1) as usize].load(Ordering::SeqCst) != 0 {
            return false;
        }

        self.global_epoch
            .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Schedule an object for reclamation once the current epoch is unreachable
    pub fn defer_reclaim<T: EpochReclaim + 'static>(&self, object: T) {
        let current_epoch = self.current_epoch();
        let mut pending = self.pending_reclaims.lock();
        pending
            .entry(current_epoch)
            .or_default()
            .push(Box::new(object));
    }

    /// Try to reclaim objects that no reader can still observe
    ///
    /// Returns the number of objects reclaimed.
    pub fn try_reclaim(&self) -> usize {
        for _ in 0..epoch::GRACE {
            if !self.try_advance() {
                break;
            }
        }

        let current_epoch = self.current_epoch();
        let ready: Vec<Box<dyn EpochReclaim>> = {
            let mut pending = self.pending_reclaims.lock();
            let safe_epochs: Vec<EpochNumber> = pending
                .keys()
                .copied()
                .filter(|&retired| retired + epoch::GRACE <= current_epoch)
                .collect();

            safe_epochs
                .into_iter()
                .filter_map(|retired| pending.remove(&retired))
                .flatten()
                .collect()
        };

        // Destructors run outside the pending lock
        let count = ready.len();
        for mut object in ready {
            object.reclaim();
        }
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Number of readers currently inside a read-side section
    pub fn active_readers(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }

    /// Get statistics about the reclamation system
    pub fn stats(&self) -> EpochStats {
        let pending_reclamations = {
            let pending = self.pending_reclaims.lock();
            pending.values().map(|v| v.len()).sum()
        };

        EpochStats {
            current_epoch: self.current_epoch(),
            active_readers: self.active_readers(),
            pending_reclamations,
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochDomain {
    fn drop(&mut self) {
        // No reader can hold a guard once the domain itself is going away
        for (_, objects) in self.pending_reclaims.get_mut().drain() {
            for mut object in objects {
                object.reclaim();
            }
        }
    }
}

/// Statistics about the reclamation system
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    /// Current global epoch
    pub current_epoch: EpochNumber,
    /// Readers inside a read-side section
    pub active_readers: usize,
    /// Number of objects pending reclamation
    pub pending_reclamations: usize,
    /// Objects reclaimed since creation
    pub reclaimed: u64,
}

/// Read-side section; values loaded while it is held stay valid until drop
#[derive(Debug)]
pub struct ReadGuard<'a> {
    domain: &'a EpochDomain,
    parity: usize,
    epoch: EpochNumber,
}

impl ReadGuard<'_> {
    /// Epoch this reader entered in
    pub fn epoch(&self) -> EpochNumber {
        self.epoch
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.domain.readers[self.parity].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct TestObject {
        reclaimed: Arc<AtomicUsize>,
    }

    impl EpochReclaim for TestObject {
        fn reclaim(&mut self) {
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_epoch_advance() {
        let domain = EpochDomain::new();
        assert_eq!(domain.current_epoch(), epoch::INITIAL);

        assert!(domain.try_advance());
        assert!(domain.try_advance());
        assert_eq!(domain.current_epoch(), epoch::INITIAL + 2);
    }

    #[test]
    fn test_reclamation_without_readers() {
        let domain = EpochDomain::new();
        let reclaimed = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            domain.defer_reclaim(TestObject {
                reclaimed: reclaimed.clone(),
            });
        }

        assert_eq!(domain.try_reclaim(), 5);
        assert_eq!(reclaimed.load(Ordering::Relaxed), 5);
        assert_eq!(domain.stats().pending_reclamations, 0);
    }

    #[test]
    fn test_reader_prevents_reclamation() {
        let domain = EpochDomain::new();
        let reclaimed = Arc::new(AtomicUsize::new(0));

        let guard = domain.read();
        domain.defer_reclaim(TestObject {
            reclaimed: reclaimed.clone(),
        });

        // One advance is possible, the second needs the reader's parity drained
        assert_eq!(domain.try_reclaim(), 0);
        assert_eq!(domain.try_reclaim(), 0);
        assert_eq!(reclaimed.load(Ordering::Relaxed), 0);
        assert_eq!(domain.stats().active_readers, 1);

        drop(guard);

        assert_eq!(domain.try_reclaim(), 1);
        assert_eq!(reclaimed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_late_reader_does_not_block_old_retirements() {
        let domain = EpochDomain::new();
        let reclaimed = Arc::new(AtomicUsize::new(0));

        domain.defer_reclaim(TestObject {
            reclaimed: reclaimed.clone(),
        });
        assert!(domain.try_advance());
        assert!(domain.try_advance());

        // Entered after the retirement's grace period already elapsed
        let _guard = domain.read();
        assert_eq!(domain.try_reclaim(), 1);
    }

    #[test]
    fn test_concurrent_readers() {
        let domain = Arc::new(EpochDomain::new());
        let barrier = Arc::new(Barrier::new(3));
        let release = Arc::new(Barrier::new(3));
        let reclaimed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let domain = domain.clone();
                let barrier = barrier.clone();
                let release = release.clone();
                thread::spawn(move || {
                    let guard = domain.read();
                    barrier.wait();
                    release.wait();
                    drop(guard);
                })
            })
            .collect();

        barrier.wait();
        domain.defer_reclaim(TestObject {
            reclaimed: reclaimed.clone(),
        });
        assert_eq!(domain.try_reclaim(), 0);

        release.wait();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(domain.try_reclaim(), 1);
        assert_eq!(reclaimed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_reclaims_pending() {
        let reclaimed = Arc::new(AtomicUsize::new(0));
        {
            let domain = EpochDomain::new();
            let _guard_epoch = domain.read().epoch();
            domain.defer_reclaim(TestObject {
                reclaimed: reclaimed.clone(),
            });
        }
        assert_eq!(reclaimed.load(Ordering::Relaxed), 1);
    }
}
