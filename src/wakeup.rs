//! Non-blocking wakeup dispatch
//!
//! Channels and applications reach their protocol driver through the same
//! primitive: read the published route inside an epoch read section, call the
//! handler if a driver is attached, report `NotBound` otherwise. Nothing on
//! this path takes a lock or waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;

use crate::{
    application::Application,
    channel::Channel,
    error::{NeuronError, Result},
    protocol::{ProtocolDriver, ProtocolId},
    sync::DriverSlot,
};

/// What a channel publishes while its protocol is driven
#[derive(Debug)]
pub(crate) struct ChannelRoute {
    pub(crate) protocol: ProtocolId,
    /// Slot index of the channel within its protocol
    pub(crate) identity: u32,
    pub(crate) driver: Arc<dyn ProtocolDriver>,
}

/// What an application publishes while its protocol is driven
#[derive(Debug)]
pub(crate) struct AppRoute {
    pub(crate) protocol: ProtocolId,
    pub(crate) driver: Arc<dyn ProtocolDriver>,
}

/// Wakeup source
#[derive(Debug, Clone, Copy)]
pub enum WakeupTarget<'a> {
    /// A channel became ready; the event is the channel's identity
    Channel(&'a Channel),
    /// An application raised an event
    Application {
        application: &'a Application,
        event: u32,
    },
}

/// Deliver a wakeup to whatever driver currently serves `target`
pub fn notify(target: WakeupTarget<'_>) -> Result<()> {
    match target {
        WakeupTarget::Channel(channel) => channel.wakeup(),
        WakeupTarget::Application { application, event } => application.wakeup(event),
    }
}

pub(crate) fn dispatch<R: Send + Sync + 'static>(
    slot: &DriverSlot<R>,
    stats: &WakeupStats,
    deliver: impl FnOnce(&R) -> Result<()>,
) -> Result<()> {
    let result = slot.with(|route| match route {
        Some(route) => deliver(route),
        None => Err(NeuronError::NotBound),
    });
    stats.record(&result);
    result
}

pub(crate) fn channel_wakeup(slot: &DriverSlot<ChannelRoute>, stats: &WakeupStats) -> Result<()> {
    dispatch(slot, stats, |route| {
        trace!(
            "channel wakeup: protocol {} channel {} -> {}",
            route.protocol,
            route.identity,
            route.driver.name()
        );
        route.driver.channel_wakeup(route.protocol, route.identity)
    })
}

pub(crate) fn app_wakeup(
    slot: &DriverSlot<AppRoute>,
    stats: &WakeupStats,
    event: u32,
) -> Result<()> {
    dispatch(slot, stats, |route| {
        trace!(
            "app wakeup: protocol {} event {} -> {}",
            route.protocol,
            event,
            route.driver.name()
        );
        route.driver.app_wakeup(route.protocol, event)
    })
}

/// Per-entity wakeup counters
#[derive(Debug, Default)]
pub struct WakeupStats {
    delivered: AtomicU64,
    not_bound: AtomicU64,
    failed: AtomicU64,
}

impl WakeupStats {
    pub(crate) fn record(&self, result: &Result<()>) {
        let counter = match result {
            Ok(()) => &self.delivered,
            Err(NeuronError::NotBound) => &self.not_bound,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the counters
    pub fn snapshot(&self) -> WakeupCounts {
        WakeupCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            not_bound: self.not_bound.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`WakeupStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WakeupCounts {
    /// Handler ran and succeeded
    pub delivered: u64,
    /// No driver, or driver without a handler
    pub not_bound: u64,
    /// Handler ran and failed
    pub failed: u64,
}

impl WakeupCounts {
    /// All wakeups attempted
    pub fn total(&self) -> u64 {
        self.delivered + self.not_bound + self.failed
    }
}

impl std::ops::Add for WakeupCounts {
    type Output = WakeupCounts;

    fn add(self, rhs: WakeupCounts) -> WakeupCounts {
        WakeupCounts {
            delivered: self.delivered + rhs.delivered,
            not_bound: self.not_bound + rhs.not_bound,
            failed: self.failed + rhs.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{protocol::ChannelMatch, sync::EpochDomain};

    #[derive(Debug)]
    struct Counting {
        calls: AtomicU64,
    }

    impl ProtocolDriver for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn channels(&self) -> &[ChannelMatch] {
            &[]
        }

        fn channel_wakeup(&self, protocol: ProtocolId, channel: u32) -> Result<()> {
            assert_eq!((protocol, channel), (3, 1));
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_unbound_route_reports_not_bound() {
        let slot = DriverSlot::new(Arc::new(EpochDomain::new()));
        let stats = WakeupStats::default();

        let err = channel_wakeup(&slot, &stats).unwrap_err();
        assert!(err.is_not_bound());
        assert_eq!(stats.snapshot().not_bound, 1);
    }

    #[test]
    fn test_route_reaches_driver() {
        let driver = Arc::new(Counting {
            calls: AtomicU64::new(0),
        });
        let slot = DriverSlot::new(Arc::new(EpochDomain::new()));
        slot.replace(Some(Arc::new(ChannelRoute {
            protocol: 3,
            identity: 1,
            driver: driver.clone(),
        })));
        let stats = WakeupStats::default();

        channel_wakeup(&slot, &stats).unwrap();
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);

        // Counting has no application handler
        let app_slot = DriverSlot::new(Arc::new(EpochDomain::new()));
        app_slot.replace(Some(Arc::new(AppRoute {
            protocol: 3,
            driver,
        })));
        assert!(app_wakeup(&app_slot, &stats, 9).unwrap_err().is_not_bound());

        let counts = stats.snapshot();
        assert_eq!(counts.delivered, 1);
        assert_eq!(counts.not_bound, 1);
        assert_eq!(counts.total(), 2);
    }
}
