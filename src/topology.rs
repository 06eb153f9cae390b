//! Topology files describing channels, protocols and applications
//!
//! A topology is a TOML document:
//!
//! ```toml
//! match_policy = "first_declared"
//!
//! [[protocol]]
//! name = "console"
//! channels = [
//!     { kind = "message_queue", direction = "send" },
//!     { kind = "notification", direction = "receive" },
//! ]
//!
//! [[channel]]
//! kind = "message_queue"
//! direction = "send"
//! depth = 32
//!
//! [[channel]]
//! kind = "notification"
//! direction = "receive"
//!
//! [[application]]
//! kind = "console"
//! protocol = "console"
//! ```
//!
//! [`Topology::apply`] creates a loopback transport for every channel: the
//! bus gets one end, the returned [`Loopback`] keeps the peer end so the
//! caller can play the remote side.

use std::{path::Path, sync::Arc};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    application::Application,
    bus::Bus,
    channel::{Channel, ChannelDescriptor, ChannelKind, ChannelLimits, Direction},
    config::{BusConfig, MatchPolicy, SegmentConfig},
    error::{NeuronError, Result},
    protocol::{ChannelMatch, Protocol, ProtocolConfig},
    transport::{
        Doorbell, DoorbellEndpoint, MessageQueue, QueueConfig, QueueEndpoint, RegionConfig,
        SharedRegion, Transport,
    },
};

/// Default size of shared-memory regions declared without one
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

/// A whole deployment: bus settings plus everything to register
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Topology {
    pub match_policy: MatchPolicy,
    /// Overrides the default segment size limit
    pub max_segment_capacity: Option<usize>,
    #[serde(rename = "channel")]
    pub channels: Vec<ChannelSpec>,
    #[serde(rename = "protocol")]
    pub protocols: Vec<ProtocolSpec>,
    #[serde(rename = "application")]
    pub applications: Vec<ApplicationSpec>,
}

/// A channel and the loopback transport behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub direction: Direction,
    pub name: Option<String>,
    pub process: Option<String>,
    /// Queue depth (message queues)
    pub depth: Option<usize>,
    /// Largest message (message queues)
    pub max_message_size: Option<usize>,
    /// Use the vectored call set (message queues)
    #[serde(default)]
    pub vectored: bool,
    /// Hold traffic until the handshake completes (message queues)
    #[serde(default)]
    pub handshake: bool,
    /// Region size in bytes (shared memory)
    pub size: Option<usize>,
}

/// A protocol definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolSpec {
    pub name: String,
    pub channels: Vec<ChannelMatch>,
    #[serde(default)]
    pub processes: Vec<String>,
}

/// An application on top of a protocol, referenced by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationSpec {
    pub kind: String,
    pub protocol: String,
}

impl ChannelSpec {
    fn queue_config(&self) -> QueueConfig {
        let defaults = QueueConfig::default();
        QueueConfig::default()
            .with_depth(self.depth.unwrap_or(defaults.depth))
            .with_max_message_size(self.max_message_size.unwrap_or(defaults.max_message_size))
            .with_vectored(self.vectored)
            .with_handshake(self.handshake)
    }

    fn descriptor(&self) -> ChannelDescriptor {
        let mut descriptor = ChannelDescriptor::new(self.kind, self.direction);
        if let Some(name) = &self.name {
            descriptor = descriptor.with_name(name.clone());
        }
        if let Some(process) = &self.process {
            descriptor = descriptor.with_process(process.clone());
        }
        descriptor
    }

    /// Build the transport pair: the bus side and the peer side
    fn build(&self, index: usize) -> Result<(ChannelDescriptor, Arc<dyn Transport>, Peer)> {
        let descriptor = self.descriptor();
        match self.kind {
            ChannelKind::MessageQueue => {
                let config = self.queue_config();
                config.validate()?;
                let limits = if config.require_handshake {
                    ChannelLimits::default()
                } else {
                    config.limits()
                };
                let (tx, rx) = MessageQueue::pair(config);
                let (local, peer) = match self.direction {
                    Direction::Send => (tx, rx),
                    Direction::Receive => (rx, tx),
                    Direction::Bidirectional => {
                        return Err(self.unsupported_direction(index));
                    }
                };
                Ok((
                    descriptor.with_limits(limits),
                    local as Arc<dyn Transport>,
                    Peer::Queue(peer),
                ))
            }
            ChannelKind::Notification => {
                let (ring, listen) = Doorbell::pair();
                let (local, peer) = match self.direction {
                    Direction::Send => (ring, listen),
                    Direction::Receive => (listen, ring),
                    Direction::Bidirectional => {
                        return Err(self.unsupported_direction(index));
                    }
                };
                Ok((descriptor, local as Arc<dyn Transport>, Peer::Doorbell(peer)))
            }
            ChannelKind::SharedMemory => {
                let name = self
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("neuron-region-{}", index));
                let size = self.size.unwrap_or(DEFAULT_REGION_SIZE);
                let region = Arc::new(SharedRegion::new(RegionConfig::new(name, size))?);
                Ok((
                    descriptor,
                    region.clone() as Arc<dyn Transport>,
                    Peer::Region(region),
                ))
            }
        }
    }

    fn unsupported_direction(&self, index: usize) -> NeuronError {
        NeuronError::invalid_parameter(
            format!("channel[{}].direction", index),
            format!("{} channels cannot be {}", self.kind, self.direction),
        )
    }
}

impl Topology {
    /// Parse a topology from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| NeuronError::config("invalid topology", e))
    }

    /// Load a topology file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| NeuronError::config(format!("cannot read {}", path.display()), e))?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| NeuronError::config("cannot serialize topology", e))
    }

    /// Bus configuration requested by this topology
    pub fn bus_config(&self) -> BusConfig {
        let mut segments = SegmentConfig::default();
        if let Some(capacity) = self.max_segment_capacity {
            segments = segments.with_max_segment_capacity(capacity);
        }
        BusConfig::default()
            .with_match_policy(self.match_policy)
            .with_segments(segments)
    }

    /// Create a bus configured by this topology and register everything on it
    pub fn instantiate(&self) -> Result<(Bus, Loopback)> {
        let bus = Bus::new(self.bus_config())?;
        let loopback = self.apply(&bus)?;
        Ok((bus, loopback))
    }

    /// Register protocols, then channels, then applications on `bus`
    ///
    /// Channels no protocol fits stay queued on the bus; they are not an
    /// error here.
    pub fn apply(&self, bus: &Bus) -> Result<Loopback> {
        let mut loopback = Loopback::default();

        for spec in &self.protocols {
            let config = ProtocolConfig {
                name: spec.name.clone(),
                shape: spec.channels.clone(),
                process_names: spec.processes.clone(),
            };
            loopback.protocols.push(bus.register_protocol(config)?);
        }

        for (index, spec) in self.channels.iter().enumerate() {
            let (descriptor, transport, peer) = spec.build(index)?;
            let channel = match bus.register_channel(descriptor, transport) {
                Ok(channel) => channel,
                Err(NeuronError::ShapeMismatch { channel }) => bus
                    .channel(channel)
                    .ok_or_else(|| NeuronError::not_found("channel", channel))?,
                Err(err) => return Err(err),
            };
            debug!("topology channel {} registered as {}", index, channel.id());
            loopback.endpoints.push(Endpoint { channel, peer });
        }

        for spec in &self.applications {
            let protocol = loopback
                .protocols
                .iter()
                .find(|p| p.name() == spec.protocol && p.application().is_none())
                .ok_or_else(|| {
                    NeuronError::invalid_parameter(
                        "application.protocol",
                        format!("no free protocol named '{}'", spec.protocol),
                    )
                })?;
            let application = bus.register_application(spec.kind.clone(), protocol.id())?;
            loopback.applications.push(application);
        }

        info!(
            "topology applied: {} channels, {} protocols, {} applications",
            loopback.endpoints.len(),
            loopback.protocols.len(),
            loopback.applications.len()
        );
        Ok(loopback)
    }
}

/// Remote side of a loopback transport
#[derive(Debug, Clone)]
pub enum Peer {
    Queue(Arc<QueueEndpoint>),
    Doorbell(Arc<DoorbellEndpoint>),
    /// The region itself; both sides map the same memory
    Region(Arc<SharedRegion>),
}

impl Peer {
    /// The peer as a plain transport
    pub fn transport(&self) -> Arc<dyn Transport> {
        match self {
            Peer::Queue(endpoint) => endpoint.clone() as Arc<dyn Transport>,
            Peer::Doorbell(endpoint) => endpoint.clone() as Arc<dyn Transport>,
            Peer::Region(region) => region.clone() as Arc<dyn Transport>,
        }
    }
}

/// A registered channel and the peer end of its transport
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub channel: Arc<Channel>,
    pub peer: Peer,
}

/// Everything [`Topology::apply`] registered, in file order
#[derive(Debug, Default)]
pub struct Loopback {
    pub endpoints: Vec<Endpoint>,
    pub protocols: Vec<Arc<Protocol>>,
    pub applications: Vec<Arc<Application>>,
}

impl Loopback {
    /// Complete the handshake of every queue waiting for one
    ///
    /// Returns how many handshakes this call completed.
    pub fn complete_handshakes(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|endpoint| match &endpoint.peer {
                Peer::Queue(queue) => queue.complete_handshake(),
                _ => false,
            })
            .count()
    }

    /// Endpoint of the channel with the given id
    pub fn endpoint(&self, channel: u64) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.channel.id() == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolState;

    const CONSOLE: &str = r#"
        [[protocol]]
        name = "console"
        channels = [
            { kind = "message_queue", direction = "send" },
            { kind = "notification", direction = "receive" },
        ]

        [[channel]]
        kind = "notification"
        direction = "receive"

        [[channel]]
        kind = "message_queue"
        direction = "send"
        depth = 4

        [[channel]]
        kind = "shared_memory"
        direction = "bidirectional"
        size = 4096

        [[application]]
        kind = "console"
        protocol = "console"
    "#;

    #[test]
    fn test_parse_topology() {
        let topology = Topology::from_toml_str(CONSOLE).unwrap();
        assert_eq!(topology.match_policy, MatchPolicy::FirstDeclared);
        assert_eq!(topology.channels.len(), 3);
        assert_eq!(topology.channels[1].depth, Some(4));
        assert_eq!(topology.protocols[0].channels.len(), 2);
        assert_eq!(topology.applications[0].protocol, "console");
    }

    #[test]
    fn test_unknown_field_is_config_error() {
        let text = r#"
            [[channel]]
            kind = "message_queue"
            direction = "send"
            colour = 1
        "#;
        let err = Topology::from_toml_str(text).unwrap_err();
        assert!(matches!(err, NeuronError::Config { .. }));
    }

    #[test]
    fn test_apply_binds_and_queues() {
        let topology = Topology::from_toml_str(CONSOLE).unwrap();
        let (bus, loopback) = topology.instantiate().unwrap();

        let protocol = &loopback.protocols[0];
        assert_eq!(protocol.state(), ProtocolState::Bound);
        assert_eq!(protocol.channel(0).unwrap().kind(), ChannelKind::MessageQueue);
        assert_eq!(protocol.channel(1).unwrap().kind(), ChannelKind::Notification);

        let unbound = bus.unbound_channels();
        assert_eq!(unbound.len(), 1);
        assert_eq!(unbound[0].kind(), ChannelKind::SharedMemory);
        assert_eq!(loopback.applications[0].protocol(), protocol.id());
    }

    #[test]
    fn test_bidirectional_queue_rejected() {
        let topology = Topology::from_toml_str(
            "[[channel]]\nkind = \"message_queue\"\ndirection = \"bidirectional\"\n",
        )
        .unwrap();
        let bus = Bus::new(topology.bus_config()).unwrap();
        assert!(matches!(
            topology.apply(&bus),
            Err(NeuronError::InvalidParameter { .. })
        ));
    }
}
