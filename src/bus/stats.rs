//! Statistics for the bus

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{buffers::AllocationStats, sync::EpochStats, wakeup::WakeupCounts};

/// Lifetime counters of binding activity
#[derive(Debug, Default)]
pub struct BindingCounters {
    /// Channels claimed into a protocol slot
    pub channels_claimed: AtomicU64,
    /// Registrations that ended unbound with a shape mismatch
    pub shape_mismatches: AtomicU64,
    /// Protocol driver attachments
    pub activations: AtomicU64,
    /// Protocol driver probes that failed
    pub failed_probes: AtomicU64,
    /// "Protocol ready" notifications delivered
    pub ready_notifications: AtomicU64,
    /// Protocols torn down because a channel or their application went away
    pub severed: AtomicU64,
}

impl BindingCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of everything a bus tracks
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub channels: usize,
    /// Channels waiting for a protocol
    pub unbound_channels: usize,
    pub protocols_pending: usize,
    pub protocols_bound: usize,
    pub protocols_active: usize,
    pub applications: usize,
    pub protocol_drivers: usize,
    pub app_drivers: usize,
    pub channels_claimed: u64,
    pub shape_mismatches: u64,
    pub activations: u64,
    pub failed_probes: u64,
    pub ready_notifications: u64,
    pub severed: u64,
    /// Wakeups raised by registered channels
    pub channel_wakeups: WakeupCounts,
    /// Wakeups raised by registered applications
    pub app_wakeups: WakeupCounts,
    pub epoch: EpochStats,
    pub segments: AllocationStats,
}

impl BusStats {
    pub(crate) fn with_counters(mut self, counters: &BindingCounters) -> Self {
        self.channels_claimed = BindingCounters::load(&counters.channels_claimed);
        self.shape_mismatches = BindingCounters::load(&counters.shape_mismatches);
        self.activations = BindingCounters::load(&counters.activations);
        self.failed_probes = BindingCounters::load(&counters.failed_probes);
        self.ready_notifications = BindingCounters::load(&counters.ready_notifications);
        self.severed = BindingCounters::load(&counters.severed);
        self
    }

    /// Total registered protocols
    pub fn protocols(&self) -> usize {
        self.protocols_pending + self.protocols_bound + self.protocols_active
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "BusStats {{ channels: {} ({} unbound), protocols: {} ({} active), applications: {}, \
             wakeups: {} delivered / {} not bound, pending reclaims: {} }}",
            self.channels,
            self.unbound_channels,
            self.protocols(),
            self.protocols_active,
            self.applications,
            self.channel_wakeups.delivered + self.app_wakeups.delivered,
            self.channel_wakeups.not_bound + self.app_wakeups.not_bound,
            self.epoch.pending_reclamations
        )
    }
}
