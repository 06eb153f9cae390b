//! Topology file tests
//!
//! Tests load deployments from disk, bring them up on a bus with drivers
//! attached and drive traffic through the loopback peers.

use std::{fs, path::PathBuf, sync::Arc};

use neuron::{
    topology::Peer, AllocFlags, Bus, ChannelKind, ChannelLimits, MatchPolicy, NeuronError,
    ProtocolState, SignalDriver, Topology, Transport,
};
use tempfile::TempDir;

const DEPLOYMENT: &str = r#"
match_policy = "by_name"
max_segment_capacity = 64

[[protocol]]
name = "console"
channels = [
    { kind = "message_queue", direction = "send", name = "out" },
    { kind = "message_queue", direction = "receive", name = "in" },
]

[[protocol]]
name = "display"
channels = [
    { kind = "shared_memory", direction = "bidirectional" },
    { kind = "notification", direction = "receive" },
]

[[channel]]
kind = "message_queue"
direction = "receive"
name = "in"
depth = 8
max_message_size = 256
handshake = true

[[channel]]
kind = "message_queue"
direction = "send"
name = "out"

[[channel]]
kind = "shared_memory"
direction = "bidirectional"
size = 8192

[[channel]]
kind = "notification"
direction = "receive"

[[application]]
kind = "terminal"
protocol = "console"
"#;

fn write_topology(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("topology.toml");
    fs::write(&path, text).unwrap();
    path
}

#[cfg(test)]
mod topology_tests {
    use super::*;

    /// Test: a topology file binds every channel into its declared slot
    #[test]
    fn test_load_and_instantiate() {
        let dir = TempDir::new().unwrap();
        let topology = Topology::load(write_topology(&dir, DEPLOYMENT)).unwrap();
        assert_eq!(topology.match_policy, MatchPolicy::ByName);

        let (bus, loopback) = topology.instantiate().unwrap();
        assert_eq!(bus.config().segments.max_segment_capacity, 64);
        assert!(bus.unbound_channels().is_empty());

        let console = &loopback.protocols[0];
        assert_eq!(console.state(), ProtocolState::Bound);
        assert_eq!(console.channel(0).unwrap().name(), Some("out"));
        assert_eq!(console.channel(1).unwrap().name(), Some("in"));

        let display = &loopback.protocols[1];
        assert_eq!(display.state(), ProtocolState::Bound);
        assert_eq!(
            display.channel(0).unwrap().kind(),
            ChannelKind::SharedMemory
        );

        assert_eq!(loopback.applications.len(), 1);
        assert_eq!(loopback.applications[0].protocol(), console.id());
        assert_eq!(console.application(), Some(loopback.applications[0].id()));
        assert!(display.application().is_none());
    }

    /// Test: drivers registered before the topology activate its protocols
    #[test]
    fn test_apply_with_drivers() {
        let topology = Topology::from_toml_str(DEPLOYMENT).unwrap();
        let bus = Bus::new(topology.bus_config()).unwrap();

        let console_shape = topology.protocols[0].channels.clone();
        let driver = Arc::new(SignalDriver::new("console-driver", console_shape).unwrap());
        bus.register_protocol_driver(driver.clone()).unwrap();

        let loopback = topology.apply(&bus).unwrap();
        let console = &loopback.protocols[0];
        assert_eq!(console.state(), ProtocolState::Active);
        assert_eq!(loopback.protocols[1].state(), ProtocolState::Bound);
        assert_eq!(driver.protocols().len(), 1);

        // The handshake queue holds its limits back until completed
        let inbound = console.channel(1).unwrap();
        assert!(!inbound.limits().is_known());
        assert_eq!(loopback.complete_handshakes(), 1);
        assert_eq!(loopback.complete_handshakes(), 0);
        assert_eq!(inbound.limits(), ChannelLimits::new(256, 8));

        let peer = match &loopback.endpoint(inbound.id()).unwrap().peer {
            Peer::Queue(queue) => queue.clone(),
            other => panic!("unexpected peer {:?}", other),
        };
        let wakeups_before = driver.stats().channel_wakeups;

        let mut message = bus.allocate(100, AllocFlags::Atomic).unwrap();
        message.fill_from(&[7u8; 100]).unwrap();
        assert_eq!(message.segment_count(), 2);
        peer.send(&message).unwrap();
        assert_eq!(driver.stats().channel_wakeups, wakeups_before + 1);

        let mut inbox = bus.allocate(256, AllocFlags::Atomic).unwrap();
        assert_eq!(inbound.receive(&mut inbox).unwrap().get(), 100);
        assert_eq!(inbox.to_vec(), vec![7u8; 100]);
    }

    /// Test: both ends of a shared-memory channel see the same bytes
    #[test]
    fn test_shared_region_peer() {
        let topology = Topology::from_toml_str(DEPLOYMENT).unwrap();
        let (_bus, loopback) = topology.instantiate().unwrap();

        let channel = loopback.protocols[1].channel(0).unwrap();
        let endpoint = loopback.endpoint(channel.id()).unwrap();
        let region = match &endpoint.peer {
            Peer::Region(region) => region.clone(),
            other => panic!("unexpected peer {:?}", other),
        };
        assert_eq!(region.size(), 8192);

        region.write(4096, b"frame").unwrap();
        let mut out = [0u8; 5];
        channel.region().unwrap().read(4096, &mut out).unwrap();
        assert_eq!(&out, b"frame");
        assert!(region.write(8190, b"frame").is_err());
    }

    /// Test: a missing topology file is a configuration error
    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Topology::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, NeuronError::Config { .. }));
    }

    /// Test: an application naming an unknown protocol is rejected
    #[test]
    fn test_unknown_application_protocol() {
        let text = r#"
            [[protocol]]
            name = "console"
            channels = [{ kind = "notification", direction = "receive" }]

            [[application]]
            kind = "terminal"
            protocol = "serial"
        "#;
        let topology = Topology::from_toml_str(text).unwrap();
        assert!(matches!(
            topology.instantiate(),
            Err(NeuronError::InvalidParameter { .. })
        ));
    }

    /// Test: a topology survives being written back out
    #[test]
    fn test_serialize_back() {
        let topology = Topology::from_toml_str(DEPLOYMENT).unwrap();
        let text = topology.to_toml_string().unwrap();
        assert_eq!(Topology::from_toml_str(&text).unwrap(), topology);
    }
}
