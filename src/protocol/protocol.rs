//! Protocol instances and their binding state

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::driver::{ChannelMatch, ProtocolDriver, ProtocolId};
use crate::{
    application::ApplicationId,
    channel::{Channel, ChannelKind, Direction},
    error::{NeuronError, Result},
    sync::{DriverSlot, EpochDomain},
};

/// Binding progress of a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Some slots are still open
    Pending,
    /// Every slot is filled, no driver attached
    Bound,
    /// A protocol driver serves the protocol
    Active,
    /// Torn down and removed from the bus; the handle stays driverless
    Severed,
}

impl ProtocolState {
    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolState::Pending => "pending",
            ProtocolState::Bound => "bound",
            ProtocolState::Active => "active",
            ProtocolState::Severed => "severed",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// What a protocol needs before it can be bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    pub name: String,
    /// Ordered slots, each filled by exactly one channel
    pub shape: Vec<ChannelMatch>,
    /// Components the protocol must be compatible with
    pub process_names: Vec<String>,
}

impl ProtocolConfig {
    /// Create an empty protocol definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            process_names: Vec::new(),
        }
    }

    /// Append an unnamed slot
    pub fn with_channel(mut self, kind: ChannelKind, direction: Direction) -> Self {
        self.shape.push(ChannelMatch::new(kind, direction));
        self
    }

    /// Append a named slot
    pub fn with_named_channel(
        mut self,
        kind: ChannelKind,
        direction: Direction,
        name: impl Into<String>,
    ) -> Self {
        self.shape.push(ChannelMatch::named(kind, direction, name));
        self
    }

    /// Require compatibility with a component
    pub fn with_process(mut self, name: impl Into<String>) -> Self {
        self.process_names.push(name.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.shape.is_empty() {
            return Err(NeuronError::invalid_parameter(
                "shape",
                format!("protocol '{}' declares no channels", self.name),
            ));
        }
        if u32::try_from(self.shape.len()).is_err() {
            return Err(NeuronError::invalid_parameter(
                "shape",
                "too many channels in shape",
            ));
        }
        Ok(())
    }
}

/// State guarded by the protocol lock
#[derive(Debug)]
pub(crate) struct ProtocolInner {
    pub(crate) state: ProtocolState,
    pub(crate) slots: Vec<Option<Arc<Channel>>>,
    pub(crate) application: Option<ApplicationId>,
    /// "Protocol ready" already went out for the current activation
    pub(crate) ready_delivered: bool,
}

impl ProtocolInner {
    pub(crate) fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// A set of channels exposed to an application through a protocol driver
///
/// All driver writes for the protocol, its channels and its application
/// happen under this protocol's lock; reads go through RCU slots.
#[derive(Debug)]
pub struct Protocol {
    id: ProtocolId,
    name: String,
    shape: Vec<ChannelMatch>,
    process_names: Vec<String>,
    inner: Mutex<ProtocolInner>,
    driver: DriverSlot<dyn ProtocolDriver>,
}

impl Protocol {
    pub(crate) fn new(id: ProtocolId, config: ProtocolConfig, domain: Arc<EpochDomain>) -> Self {
        let slots = vec![None; config.shape.len()];
        Self {
            id,
            name: config.name,
            shape: config.shape,
            process_names: config.process_names,
            inner: Mutex::new(ProtocolInner {
                state: ProtocolState::Pending,
                slots,
                application: None,
                ready_delivered: false,
            }),
            driver: DriverSlot::new(domain),
        }
    }

    pub fn id(&self) -> ProtocolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared slots in order
    pub fn shape(&self) -> &[ChannelMatch] {
        &self.shape
    }

    /// Declared process names
    pub fn process_names(&self) -> &[String] {
        &self.process_names
    }

    pub fn state(&self) -> ProtocolState {
        self.inner.lock().state
    }

    /// Check if every slot is filled
    pub fn is_bound(&self) -> bool {
        matches!(
            self.state(),
            ProtocolState::Bound | ProtocolState::Active
        )
    }

    /// Owning application, if one is registered
    pub fn application(&self) -> Option<ApplicationId> {
        self.inner.lock().application
    }

    /// Channels by slot, `None` for open slots
    pub fn channels(&self) -> Vec<Option<Arc<Channel>>> {
        self.inner.lock().slots.clone()
    }

    /// Channel filling `slot`
    pub fn channel(&self, slot: u32) -> Option<Arc<Channel>> {
        self.inner
            .lock()
            .slots
            .get(slot as usize)
            .cloned()
            .flatten()
    }

    /// Number of filled slots
    pub fn filled_slots(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }

    /// Protocol driver currently attached
    pub fn driver(&self) -> Option<Arc<dyn ProtocolDriver>> {
        self.driver.load()
    }

    /// Check if a protocol driver is attached
    pub fn has_driver(&self) -> bool {
        self.driver.is_set()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProtocolInner> {
        self.inner.lock()
    }

    pub(crate) fn driver_slot(&self) -> &DriverSlot<dyn ProtocolDriver> {
        &self.driver
    }
}
