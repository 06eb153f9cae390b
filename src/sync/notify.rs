//! Event notification for protocol worker threads
//!
//! Wakeup handlers must not block, so a driver typically records what became
//! ready and then signals an [`EventNotifier`]; a worker thread waits on it
//! and does the actual processing. Uses eventfd on Linux, a condition
//! variable elsewhere.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

#[cfg(target_os = "linux")]
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::eventfd::{eventfd, EfdFlags},
    unistd::{read, write},
};

use crate::error::Result;

/// Non-blocking signal with a blocking wait side
#[derive(Debug)]
pub struct EventNotifier {
    /// Event file descriptor for Linux eventfd notifications
    #[cfg(target_os = "linux")]
    event_fd: OwnedFd,
    /// Fallback condition variable for non-Linux systems
    #[cfg(not(target_os = "linux"))]
    condvar: (parking_lot::Mutex<bool>, parking_lot::Condvar),
    /// Whether notifications are enabled
    enabled: AtomicBool,
    /// Statistics
    notify_count: AtomicU64,
    wait_count: AtomicU64,
}

impl EventNotifier {
    /// Create a new event notifier
    pub fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(target_os = "linux")]
            event_fd: eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(std::io::Error::from)?,
            #[cfg(not(target_os = "linux"))]
            condvar: (parking_lot::Mutex::new(false), parking_lot::Condvar::new()),
            enabled: AtomicBool::new(true),
            notify_count: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
        })
    }

    /// Signal the waiting side; never blocks
    pub fn notify(&self) -> Result<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        self.notify_count.fetch_add(1, Ordering::Relaxed);

        #[cfg(target_os = "linux")]
        {
            let value: u64 = 1;
            match write(self.event_fd.as_raw_fd(), &value.to_ne_bytes()) {
                // Counter saturated: the waiter is already going to wake up
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let (mutex, condvar) = &self.condvar;
            *mutex.lock() = true;
            condvar.notify_all();
        }

        Ok(())
    }

    /// Wait for a notification
    ///
    /// Returns `Ok(false)` when the timeout elapsed first. Pending
    /// notifications are consumed, so several `notify` calls may satisfy a
    /// single wait.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        self.wait_inner(timeout)
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_inner(&self, timeout: Option<Duration>) -> Result<bool> {
        let (mutex, condvar) = &self.condvar;
        let mut notified = mutex.lock();
        match timeout {
            Some(timeout) => {
                if !*notified {
                    condvar.wait_for(&mut notified, timeout);
                }
            }
            None => {
                while !*notified {
                    condvar.wait(&mut notified);
                }
            }
        }
        let signaled = *notified;
        *notified = false;
        Ok(signaled)
    }

    #[cfg(target_os = "linux")]
    fn wait_inner(&self, timeout: Option<Duration>) -> Result<bool> {
        let timeout_ms = timeout
            .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let ready = {
            let mut fds = [PollFd::new(&self.event_fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout_ms) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        };

        if ready {
            // Clear the counter; EAGAIN means another waiter drained it
            let mut buf = [0u8; 8];
            match read(self.event_fd.as_raw_fd(), &mut buf) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }

        Ok(false)
    }

    /// Get the file descriptor for external polling (Linux only)
    #[cfg(target_os = "linux")]
    pub fn event_fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    /// Enable or disable notifications
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Check if notifications are enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Get notification statistics
    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            notify_count: self.notify_count.load(Ordering::Relaxed),
            wait_count: self.wait_count.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}

/// Statistics for event notifications
#[derive(Debug, Clone)]
pub struct NotificationStats {
    /// Number of notifications sent
    pub notify_count: u64,
    /// Number of waits performed
    pub wait_count: u64,
    /// Whether notifications are currently enabled
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_then_wait() {
        let notifier = EventNotifier::new().unwrap();
        notifier.notify().unwrap();
        notifier.notify().unwrap();

        assert!(notifier.wait(Some(Duration::from_millis(100))).unwrap());
        // Both signals were coalesced into the first wait
        assert!(!notifier.wait(Some(Duration::from_millis(10))).unwrap());

        let stats = notifier.stats();
        assert_eq!(stats.notify_count, 2);
        assert_eq!(stats.wait_count, 2);
    }

    #[test]
    fn test_disabled_notifier_does_not_signal() {
        let notifier = EventNotifier::new().unwrap();
        notifier.set_enabled(false);
        notifier.notify().unwrap();
        assert!(!notifier.wait(Some(Duration::from_millis(10))).unwrap());
        assert_eq!(notifier.stats().notify_count, 0);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let notifier = Arc::new(EventNotifier::new().unwrap());
        let waiter = {
            let notifier = notifier.clone();
            thread::spawn(move || notifier.wait(Some(Duration::from_secs(5))).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        notifier.notify().unwrap();
        assert!(waiter.join().unwrap());
    }
}
