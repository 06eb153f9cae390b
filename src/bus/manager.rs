//! Component registry binding channels, protocols and applications

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::stats::{BindingCounters, BusStats};
use crate::{
    allocators::Allocator,
    application::{Application, ApplicationId},
    buffers::{AllocFlags, SegmentAllocator, SegmentedBuffer},
    channel::{Channel, ChannelBinding, ChannelDescriptor, ChannelId},
    config::{BusConfig, MatchPolicy},
    error::{NeuronError, Result},
    protocol::{
        driver_matches, matcher, process_admits, slot_accepts, ApplicationDriver, Protocol,
        ProtocolConfig, ProtocolDriver, ProtocolId, ProtocolState,
    },
    sync::EpochDomain,
    transport::Transport,
    wakeup::{ChannelRoute, WakeupCounts},
};

/// Everything the bus knows about, guarded by the registry lock
#[derive(Default)]
struct Registry {
    channels: BTreeMap<ChannelId, Arc<Channel>>,
    /// Channels waiting for a protocol, in registration order
    unbound: Vec<ChannelId>,
    /// Keyed by id, so iteration follows registration order
    protocols: BTreeMap<ProtocolId, Arc<Protocol>>,
    applications: BTreeMap<ApplicationId, Arc<Application>>,
    protocol_drivers: Vec<Arc<dyn ProtocolDriver>>,
    app_drivers: Vec<Arc<dyn ApplicationDriver>>,
}

impl Registry {
    fn application_of(&self, id: Option<ApplicationId>) -> Option<Arc<Application>> {
        id.and_then(|id| self.applications.get(&id).cloned())
    }
}

/// In-process component registry
///
/// Registration can happen in any order: channels queue until a protocol with
/// a fitting slot shows up, bound protocols wait for a matching protocol
/// driver, and applications wait for an application driver of their kind.
///
/// Locks are taken registry first, then protocol. Driver callbacks (`probe`,
/// `remove`, `protocol_ready`) run with the registry lock held and must not
/// call back into the bus. Wakeups never touch either lock.
pub struct Bus {
    config: BusConfig,
    domain: Arc<EpochDomain>,
    registry: Mutex<Registry>,
    segments: SegmentAllocator,
    next_id: AtomicU64,
    counters: BindingCounters,
}

impl Bus {
    /// Create a bus allocating buffers from the heap
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;
        let segments = SegmentAllocator::heap(config.segments.clone())?;
        Ok(Self::with_segments(config, segments))
    }

    /// Create a bus allocating buffers from `allocator`
    pub fn with_allocator(config: BusConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        let segments = SegmentAllocator::new(allocator, config.segments.clone())?;
        Ok(Self::with_segments(config, segments))
    }

    fn with_segments(config: BusConfig, segments: SegmentAllocator) -> Self {
        Self {
            config,
            domain: Arc::new(EpochDomain::new()),
            registry: Mutex::new(Registry::default()),
            segments,
            next_id: AtomicU64::new(1),
            counters: BindingCounters::default(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get configuration
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Grace-period domain shared by every driver slot of this bus
    pub fn domain(&self) -> &Arc<EpochDomain> {
        &self.domain
    }

    /// Segment allocator for message buffers
    pub fn segments(&self) -> &SegmentAllocator {
        &self.segments
    }

    /// Allocate a message buffer of `size` bytes
    pub fn allocate(&self, size: usize, flags: AllocFlags) -> Result<SegmentedBuffer> {
        self.segments.allocate(size, flags)
    }

    /// Drop detached drivers whose grace period has elapsed
    pub fn reclaim(&self) -> usize {
        self.domain.try_reclaim()
    }

    // Channels

    /// Register a channel advertised by a transport
    ///
    /// The channel is claimed by the first protocol with a fitting open slot.
    /// Without one it is queued and `ShapeMismatch` is returned; it stays
    /// reachable through [`Bus::channel`] and is claimed when a fitting
    /// protocol registers.
    pub fn register_channel(
        &self,
        descriptor: ChannelDescriptor,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Channel>> {
        let id = self.next_id();
        let channel = Channel::new(id, descriptor, transport, self.domain.clone());

        let mut registry = self.registry.lock();
        registry.channels.insert(id, channel.clone());
        debug!(
            "registered {} {} channel {}",
            channel.direction(),
            channel.kind(),
            id
        );

        match matcher::find_slot(registry.protocols.values(), &channel, self.config.match_policy) {
            Some((protocol, slot)) => {
                self.claim(&registry, &protocol, slot, &channel);
                Ok(channel)
            }
            None => {
                registry.unbound.push(id);
                BindingCounters::bump(&self.counters.shape_mismatches);
                debug!("channel {} queued: no open slot fits", id);
                Err(NeuronError::shape_mismatch(id))
            }
        }
    }

    /// Claim `slot` of `protocol` for a specific channel
    ///
    /// The slot's name is not consulted, so an explicit binding can place an
    /// unnamed channel into a named slot under [`MatchPolicy::ByName`].
    /// Tuple and process constraints still apply.
    ///
    /// [`MatchPolicy::ByName`]: crate::config::MatchPolicy::ByName
    pub fn bind_channel(&self, channel: ChannelId, protocol: ProtocolId, slot: u32) -> Result<()> {
        let mut registry = self.registry.lock();
        let channel = registry
            .channels
            .get(&channel)
            .cloned()
            .ok_or_else(|| NeuronError::not_found("channel", channel))?;
        let protocol = registry
            .protocols
            .get(&protocol)
            .cloned()
            .ok_or_else(|| NeuronError::not_found("protocol", protocol))?;

        if let Some(binding) = channel.binding() {
            return Err(NeuronError::duplicate(format!(
                "channel {} already fills slot {} of protocol {}",
                channel.id(),
                binding.identity,
                binding.protocol
            )));
        }

        let index = slot as usize;
        {
            let inner = protocol.lock();
            let wanted = protocol.shape().get(index).ok_or_else(|| {
                NeuronError::invalid_parameter(
                    "slot",
                    format!("protocol {} has {} slots", protocol.id(), protocol.shape().len()),
                )
            })?;
            if inner.slots[index].is_some() {
                return Err(NeuronError::duplicate(format!(
                    "slot {} of protocol {}",
                    slot,
                    protocol.id()
                )));
            }
            if inner.state != ProtocolState::Pending
                || !slot_accepts(wanted, &channel, MatchPolicy::FirstDeclared)
                || !process_admits(protocol.process_names(), &channel)
            {
                return Err(NeuronError::shape_mismatch(channel.id()));
            }
        }

        registry.unbound.retain(|id| *id != channel.id());
        self.claim(&registry, &protocol, index, &channel);
        Ok(())
    }

    /// Tear down a channel
    ///
    /// A protocol that had claimed it is torn down with it: its driver is
    /// removed and its surviving channels are matched again.
    pub fn unregister_channel(&self, id: ChannelId) -> Result<()> {
        let mut registry = self.registry.lock();
        let channel = registry
            .channels
            .remove(&id)
            .ok_or_else(|| NeuronError::not_found("channel", id))?;
        registry.unbound.retain(|queued| *queued != id);

        let owner = channel
            .binding()
            .and_then(|binding| registry.protocols.get(&binding.protocol).cloned());
        channel.detach_driver();
        channel.set_binding(None);

        if let Some(protocol) = owner {
            {
                let mut inner = protocol.lock();
                for slot in inner.slots.iter_mut() {
                    if slot.as_ref().map_or(false, |c| c.id() == id) {
                        *slot = None;
                    }
                }
            }
            warn!(
                "protocol {} ({}) torn down: channel {} went away",
                protocol.id(),
                protocol.name(),
                id
            );
            BindingCounters::bump(&self.counters.severed);
            self.teardown_protocol(&mut registry, &protocol);
        }

        debug!("unregistered channel {}", id);
        Ok(())
    }

    fn claim(
        &self,
        registry: &Registry,
        protocol: &Arc<Protocol>,
        slot: usize,
        channel: &Arc<Channel>,
    ) {
        let bound = {
            let mut inner = protocol.lock();
            inner.slots[slot] = Some(channel.clone());
            channel.set_binding(Some(ChannelBinding {
                protocol: protocol.id(),
                identity: slot as u32,
            }));
            if inner.is_full() {
                inner.state = ProtocolState::Bound;
            }
            inner.state == ProtocolState::Bound
        };

        BindingCounters::bump(&self.counters.channels_claimed);
        debug!(
            "channel {} fills slot {} of protocol {} ({})",
            channel.id(),
            slot,
            protocol.id(),
            protocol.name()
        );

        if bound {
            debug!("protocol {} bound", protocol.id());
            self.activate(registry, protocol);
        }
    }

    // Protocols

    /// Register a protocol; it claims queued channels in their registration order
    pub fn register_protocol(&self, config: ProtocolConfig) -> Result<Arc<Protocol>> {
        config.validate()?;
        let id = self.next_id();
        let protocol = Arc::new(Protocol::new(id, config, self.domain.clone()));

        let mut registry = self.registry.lock();
        registry.protocols.insert(id, protocol.clone());
        debug!(
            "registered protocol {} ({}) with {} slots",
            id,
            protocol.name(),
            protocol.shape().len()
        );

        let queued = std::mem::take(&mut registry.unbound);
        for channel_id in queued {
            let Some(channel) = registry.channels.get(&channel_id).cloned() else {
                continue;
            };
            let slot = {
                let inner = protocol.lock();
                matcher::open_slot(&protocol, &inner, &channel, self.config.match_policy)
            };
            match slot {
                Some(slot) => self.claim(&registry, &protocol, slot, &channel),
                None => registry.unbound.push(channel_id),
            }
        }

        Ok(protocol)
    }

    /// Tear down a protocol
    ///
    /// Its driver is removed and its channels go back to the unbound queue,
    /// where they are matched again against the remaining protocols. An
    /// application on top of it stays registered and sees `NotBound`.
    pub fn unregister_protocol(&self, id: ProtocolId) -> Result<()> {
        let mut registry = self.registry.lock();
        let protocol = registry
            .protocols
            .get(&id)
            .cloned()
            .ok_or_else(|| NeuronError::not_found("protocol", id))?;
        self.teardown_protocol(&mut registry, &protocol);
        Ok(())
    }

    /// Remove `protocol` from the registry and rematch its channels
    fn teardown_protocol(&self, registry: &mut Registry, protocol: &Arc<Protocol>) {
        registry.protocols.remove(&protocol.id());
        self.detach_protocol_driver(registry, protocol);

        let released: Vec<Arc<Channel>> = {
            let mut inner = protocol.lock();
            inner.application = None;
            inner.state = ProtocolState::Severed;
            inner.slots.iter_mut().filter_map(Option::take).collect()
        };
        for channel in &released {
            channel.set_binding(None);
            registry.unbound.push(channel.id());
        }
        registry.unbound.sort_unstable();
        debug!(
            "tore down protocol {} ({}), released {} channels",
            protocol.id(),
            protocol.name(),
            released.len()
        );

        self.rematch(registry);
    }

    fn rematch(&self, registry: &mut Registry) {
        let queued = std::mem::take(&mut registry.unbound);
        for channel_id in queued {
            let Some(channel) = registry.channels.get(&channel_id).cloned() else {
                continue;
            };
            match matcher::find_slot(registry.protocols.values(), &channel, self.config.match_policy)
            {
                Some((protocol, slot)) => self.claim(registry, &protocol, slot, &channel),
                None => registry.unbound.push(channel_id),
            }
        }
    }

    // Applications

    /// Register an application on top of an existing protocol
    pub fn register_application(
        &self,
        kind_tag: impl Into<String>,
        protocol: ProtocolId,
    ) -> Result<Arc<Application>> {
        let mut registry = self.registry.lock();
        let protocol = registry
            .protocols
            .get(&protocol)
            .cloned()
            .ok_or_else(|| NeuronError::not_found("protocol", protocol))?;

        let id = self.next_id();
        let application = Arc::new(Application::new(
            id,
            kind_tag,
            protocol.id(),
            self.domain.clone(),
        ));

        {
            let mut inner = protocol.lock();
            if let Some(owner) = inner.application {
                return Err(NeuronError::duplicate(format!(
                    "protocol {} already serves application {}",
                    protocol.id(),
                    owner
                )));
            }
            inner.application = Some(id);
            if let Some(driver) = protocol.driver() {
                application.attach_driver(driver);
            }
        }

        registry.applications.insert(id, application.clone());
        debug!(
            "registered {} application {} on protocol {}",
            application.kind_tag(),
            id,
            protocol.id()
        );

        let drivers = registry.app_drivers.clone();
        for driver in &drivers {
            if self.attach_app_driver(&registry, &application, driver) {
                break;
            }
        }

        Ok(application)
    }

    /// Tear down an application together with the protocol it owns
    ///
    /// The protocol's channels are released and matched again.
    pub fn unregister_application(&self, id: ApplicationId) -> Result<()> {
        let mut registry = self.registry.lock();
        let application = registry
            .applications
            .remove(&id)
            .ok_or_else(|| NeuronError::not_found("application", id))?;

        let owned = registry
            .protocols
            .get(&application.protocol())
            .filter(|protocol| protocol.application() == Some(id))
            .cloned();
        let app_driver = match &owned {
            Some(protocol) => {
                let mut inner = protocol.lock();
                inner.application = None;
                inner.ready_delivered = false;
                application.detach_driver();
                application.replace_app_driver(None)
            }
            None => {
                application.detach_driver();
                application.replace_app_driver(None)
            }
        };

        if let Some(driver) = app_driver {
            driver.remove(&application);
        }
        if let Some(protocol) = owned {
            BindingCounters::bump(&self.counters.severed);
            self.teardown_protocol(&mut registry, &protocol);
        }
        debug!("unregistered application {}", id);
        Ok(())
    }

    // Protocol drivers

    /// Register a protocol driver and attach it to every bound protocol it fits
    pub fn register_protocol_driver(&self, driver: Arc<dyn ProtocolDriver>) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry
            .protocol_drivers
            .iter()
            .any(|d| d.name() == driver.name())
        {
            return Err(NeuronError::duplicate(format!(
                "protocol driver '{}'",
                driver.name()
            )));
        }

        registry.protocol_drivers.push(driver.clone());
        info!("registered protocol driver '{}'", driver.name());

        let waiting: Vec<_> = registry
            .protocols
            .values()
            .filter(|p| p.state() == ProtocolState::Bound)
            .cloned()
            .collect();
        for protocol in waiting {
            self.attach_protocol_driver(&registry, &protocol, &driver);
        }
        Ok(())
    }

    /// Unregister a protocol driver, detaching it from every protocol it serves
    ///
    /// Each released protocol is offered to the remaining drivers.
    pub fn unregister_protocol_driver(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let position = registry
            .protocol_drivers
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| {
                NeuronError::invalid_parameter("name", format!("no protocol driver '{}'", name))
            })?;
        registry.protocol_drivers.remove(position);

        let served: Vec<_> = registry
            .protocols
            .values()
            .filter(|p| p.driver().map_or(false, |d| d.name() == name))
            .cloned()
            .collect();
        for protocol in served {
            self.detach_protocol_driver(&registry, &protocol);
            self.activate(&registry, &protocol);
        }

        info!("unregistered protocol driver '{}'", name);
        Ok(())
    }

    fn activate(&self, registry: &Registry, protocol: &Arc<Protocol>) {
        for driver in &registry.protocol_drivers {
            if self.attach_protocol_driver(registry, protocol, driver) {
                return;
            }
        }
        debug!("protocol {} bound, waiting for a driver", protocol.id());
    }

    fn attach_protocol_driver(
        &self,
        registry: &Registry,
        protocol: &Arc<Protocol>,
        driver: &Arc<dyn ProtocolDriver>,
    ) -> bool {
        if protocol.state() != ProtocolState::Bound || protocol.has_driver() {
            return false;
        }
        if !driver_matches(driver.as_ref(), protocol.shape(), protocol.process_names()) {
            return false;
        }

        if let Err(err) = driver.probe(protocol) {
            BindingCounters::bump(&self.counters.failed_probes);
            warn!(
                "driver '{}' failed to probe protocol {}: {}",
                driver.name(),
                protocol.id(),
                err
            );
            return false;
        }

        let application = {
            let mut inner = protocol.lock();
            protocol.driver_slot().replace(Some(driver.clone()));
            for (slot, channel) in inner.slots.iter().enumerate() {
                if let Some(channel) = channel {
                    channel.attach_driver(ChannelRoute {
                        protocol: protocol.id(),
                        identity: slot as u32,
                        driver: driver.clone(),
                    });
                }
            }
            let application = registry.application_of(inner.application);
            if let Some(application) = &application {
                application.attach_driver(driver.clone());
            }
            inner.state = ProtocolState::Active;
            inner.ready_delivered = false;
            application
        };

        BindingCounters::bump(&self.counters.activations);
        debug!(
            "protocol {} ({}) active with driver '{}'",
            protocol.id(),
            protocol.name(),
            driver.name()
        );

        if let Some(application) = application {
            self.deliver_ready(protocol, &application);
        }
        true
    }

    fn detach_protocol_driver(&self, registry: &Registry, protocol: &Arc<Protocol>) {
        let driver = {
            let mut inner = protocol.lock();
            let driver = protocol.driver_slot().clear();
            for channel in inner.slots.iter().flatten() {
                channel.detach_driver();
            }
            if let Some(application) = registry.application_of(inner.application) {
                application.detach_driver();
            }
            inner.ready_delivered = false;
            if inner.state == ProtocolState::Active {
                inner.state = ProtocolState::Bound;
            }
            driver
        };

        if let Some(driver) = driver {
            driver.remove(protocol);
            debug!(
                "driver '{}' detached from protocol {}",
                driver.name(),
                protocol.id()
            );
        }
    }

    // Application drivers

    /// Register an application driver and attach it to waiting applications
    pub fn register_app_driver(&self, driver: Arc<dyn ApplicationDriver>) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.app_drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(NeuronError::duplicate(format!(
                "application driver '{}'",
                driver.name()
            )));
        }

        registry.app_drivers.push(driver.clone());
        info!(
            "registered application driver '{}' for '{}'",
            driver.name(),
            driver.kind_tag()
        );

        let waiting: Vec<_> = registry.applications.values().cloned().collect();
        for application in waiting {
            self.attach_app_driver(&registry, &application, &driver);
        }
        Ok(())
    }

    /// Unregister an application driver
    ///
    /// Each released application is offered to the remaining drivers.
    pub fn unregister_app_driver(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let position = registry
            .app_drivers
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| {
                NeuronError::invalid_parameter(
                    "name",
                    format!("no application driver '{}'", name),
                )
            })?;
        let driver = registry.app_drivers.remove(position);

        let served: Vec<_> = registry
            .applications
            .values()
            .filter(|a| a.app_driver().map_or(false, |d| d.name() == name))
            .cloned()
            .collect();
        for application in served {
            if let Some(protocol) = registry.protocols.get(&application.protocol()) {
                let mut inner = protocol.lock();
                inner.ready_delivered = false;
                application.replace_app_driver(None);
            } else {
                application.replace_app_driver(None);
            }
            driver.remove(&application);

            for candidate in &registry.app_drivers {
                if self.attach_app_driver(&registry, &application, candidate) {
                    break;
                }
            }
        }

        info!("unregistered application driver '{}'", name);
        Ok(())
    }

    fn attach_app_driver(
        &self,
        registry: &Registry,
        application: &Arc<Application>,
        driver: &Arc<dyn ApplicationDriver>,
    ) -> bool {
        if application.app_driver().is_some() || driver.kind_tag() != application.kind_tag() {
            return false;
        }

        if let Err(err) = driver.probe(application) {
            warn!(
                "application driver '{}' failed to probe application {}: {}",
                driver.name(),
                application.id(),
                err
            );
            return false;
        }

        let protocol = registry.protocols.get(&application.protocol()).cloned();
        match &protocol {
            Some(protocol) => {
                let _inner = protocol.lock();
                application.replace_app_driver(Some(driver.clone()));
            }
            None => {
                application.replace_app_driver(Some(driver.clone()));
            }
        }
        debug!(
            "application {} attached to driver '{}'",
            application.id(),
            driver.name()
        );

        if let Some(protocol) = protocol {
            self.deliver_ready(&protocol, application);
        }
        true
    }

    /// Tell the application driver its protocol is usable, once per activation
    fn deliver_ready(&self, protocol: &Arc<Protocol>, application: &Arc<Application>) {
        let Some(app_driver) = application.app_driver() else {
            return;
        };

        let ready = {
            let mut inner = protocol.lock();
            let serving = protocol.driver();
            let wanted = app_driver.protocol_driver();
            let compatible = match (&serving, wanted) {
                (Some(serving), Some(wanted)) => serving.name() == wanted,
                (Some(_), None) => true,
                (None, _) => false,
            };

            let ready = inner.state == ProtocolState::Active
                && inner.application == Some(application.id())
                && !inner.ready_delivered
                && compatible;
            if ready {
                inner.ready_delivered = true;
            }
            ready
        };

        if ready {
            BindingCounters::bump(&self.counters.ready_notifications);
            debug!(
                "protocol {} ready for application {}",
                protocol.id(),
                application.id()
            );
            app_driver.protocol_ready(application);
        }
    }

    // Lookups

    /// Get a channel by id, bound or not
    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.registry.lock().channels.get(&id).cloned()
    }

    /// Get a protocol by id
    pub fn protocol(&self, id: ProtocolId) -> Option<Arc<Protocol>> {
        self.registry.lock().protocols.get(&id).cloned()
    }

    /// Get the first protocol registered under `name`
    pub fn protocol_by_name(&self, name: &str) -> Option<Arc<Protocol>> {
        self.registry
            .lock()
            .protocols
            .values()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Get an application by id
    pub fn application(&self, id: ApplicationId) -> Option<Arc<Application>> {
        self.registry.lock().applications.get(&id).cloned()
    }

    /// All channels in registration order
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.registry.lock().channels.values().cloned().collect()
    }

    /// All protocols in registration order
    pub fn protocols(&self) -> Vec<Arc<Protocol>> {
        self.registry.lock().protocols.values().cloned().collect()
    }

    /// All applications in registration order
    pub fn applications(&self) -> Vec<Arc<Application>> {
        self.registry.lock().applications.values().cloned().collect()
    }

    /// Channels waiting for a protocol, in registration order
    pub fn unbound_channels(&self) -> Vec<Arc<Channel>> {
        let registry = self.registry.lock();
        registry
            .unbound
            .iter()
            .filter_map(|id| registry.channels.get(id).cloned())
            .collect()
    }

    /// Get a snapshot of bus statistics
    pub fn stats(&self) -> BusStats {
        let registry = self.registry.lock();
        let mut stats = BusStats {
            channels: registry.channels.len(),
            unbound_channels: registry.unbound.len(),
            applications: registry.applications.len(),
            protocol_drivers: registry.protocol_drivers.len(),
            app_drivers: registry.app_drivers.len(),
            channel_wakeups: registry
                .channels
                .values()
                .map(|c| c.wakeup_stats())
                .fold(WakeupCounts::default(), |a, b| a + b),
            app_wakeups: registry
                .applications
                .values()
                .map(|a| a.wakeup_stats())
                .fold(WakeupCounts::default(), |a, b| a + b),
            epoch: self.domain.stats(),
            segments: self.segments.stats(),
            ..BusStats::default()
        };

        for protocol in registry.protocols.values() {
            match protocol.state() {
                ProtocolState::Pending => stats.protocols_pending += 1,
                ProtocolState::Bound => stats.protocols_bound += 1,
                ProtocolState::Active => stats.protocols_active += 1,
                // Torn-down protocols have already left the registry
                ProtocolState::Severed => {}
            }
        }

        stats.with_counters(&self.counters)
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("config", &self.config)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ChannelKind, Direction},
        transport::{Doorbell, MessageQueue, QueueConfig, RegionConfig, SharedRegion},
    };

    fn bus() -> Bus {
        Bus::new(BusConfig::default()).unwrap()
    }

    fn queue_send() -> (ChannelDescriptor, Arc<dyn Transport>) {
        let (tx, _rx) = MessageQueue::pair(QueueConfig::default());
        (
            ChannelDescriptor::new(ChannelKind::MessageQueue, Direction::Send),
            tx as Arc<dyn Transport>,
        )
    }

    fn bell_receive() -> (ChannelDescriptor, Arc<dyn Transport>) {
        let (_ring, listen) = Doorbell::pair();
        (
            ChannelDescriptor::new(ChannelKind::Notification, Direction::Receive),
            listen as Arc<dyn Transport>,
        )
    }

    fn queue_and_bell() -> ProtocolConfig {
        ProtocolConfig::new("console")
            .with_channel(ChannelKind::MessageQueue, Direction::Send)
            .with_channel(ChannelKind::Notification, Direction::Receive)
    }

    #[test]
    fn test_channel_without_protocol_is_queued() {
        let bus = bus();
        let (descriptor, transport) = queue_send();
        let err = bus.register_channel(descriptor, transport).unwrap_err();

        let NeuronError::ShapeMismatch { channel } = err else {
            panic!("expected shape mismatch, got {:?}", err);
        };
        let queued = bus.channel(channel).unwrap();
        assert!(!queued.is_bound());
        assert_eq!(bus.unbound_channels().len(), 1);
    }

    #[test]
    fn test_protocol_binds_when_shape_filled() {
        let bus = bus();
        let protocol = bus.register_protocol(queue_and_bell()).unwrap();

        let (descriptor, transport) = queue_send();
        let first = bus.register_channel(descriptor, transport).unwrap();
        assert_eq!(protocol.state(), ProtocolState::Pending);
        assert_eq!(first.binding().unwrap().identity, 0);

        let (descriptor, transport) = bell_receive();
        let second = bus.register_channel(descriptor, transport).unwrap();
        assert_eq!(protocol.state(), ProtocolState::Bound);
        assert_eq!(
            second.binding(),
            Some(ChannelBinding {
                protocol: protocol.id(),
                identity: 1
            })
        );
        assert_eq!(bus.stats().protocols_bound, 1);
    }

    #[test]
    fn test_explicit_binding_errors() {
        let bus = bus();
        let protocol = bus.register_protocol(queue_and_bell()).unwrap();

        let region = Arc::new(SharedRegion::new(RegionConfig::new("bind", 64)).unwrap());
        let shm_id = match bus.register_channel(
            ChannelDescriptor::new(ChannelKind::SharedMemory, Direction::Bidirectional),
            region,
        ) {
            Err(NeuronError::ShapeMismatch { channel }) => channel,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            bus.bind_channel(shm_id, protocol.id(), 0),
            Err(NeuronError::ShapeMismatch { .. })
        ));

        let (descriptor, transport) = queue_send();
        let queue = bus.register_channel(descriptor, transport).unwrap();
        assert!(matches!(
            bus.bind_channel(queue.id(), protocol.id(), 1),
            Err(NeuronError::DuplicateBinding { .. })
        ));
        assert!(matches!(
            bus.bind_channel(999, protocol.id(), 0),
            Err(NeuronError::NotFound { entity: "channel", .. })
        ));
        assert_eq!(protocol.filled_slots(), 1);
    }

    #[test]
    fn test_unregister_protocol_releases_channels() {
        let bus = bus();
        let first = bus.register_protocol(queue_and_bell()).unwrap();
        let (descriptor, transport) = queue_send();
        let channel = bus.register_channel(descriptor, transport).unwrap();
        assert_eq!(channel.binding().unwrap().protocol, first.id());

        let second = bus.register_protocol(queue_and_bell()).unwrap();
        bus.unregister_protocol(first.id()).unwrap();

        assert_eq!(channel.binding().unwrap().protocol, second.id());
        assert!(bus.protocol(first.id()).is_none());
        assert!(bus.unbound_channels().is_empty());
    }

    #[test]
    fn test_duplicate_registrations() {
        let bus = bus();
        let protocol = bus.register_protocol(queue_and_bell()).unwrap();
        bus.register_application("console", protocol.id()).unwrap();
        assert!(matches!(
            bus.register_application("console", protocol.id()),
            Err(NeuronError::DuplicateBinding { .. })
        ));
        assert!(matches!(
            bus.register_application("console", 12345),
            Err(NeuronError::NotFound { entity: "protocol", .. })
        ));
        assert!(bus.register_protocol(ProtocolConfig::new("empty")).is_err());
    }
}
