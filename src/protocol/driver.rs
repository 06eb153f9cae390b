//! Driver traits for the protocol and application layers

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Protocol;
use crate::{
    application::Application,
    channel::{ChannelKind, Direction},
    error::{NeuronError, Result},
};

/// Registry-wide protocol identifier
pub type ProtocolId = u64;

/// One slot of a protocol shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMatch {
    pub kind: ChannelKind,
    pub direction: Direction,
    /// Only consulted by the by-name match policy
    #[serde(default)]
    pub name: Option<String>,
}

impl ChannelMatch {
    /// Unnamed slot
    pub fn new(kind: ChannelKind, direction: Direction) -> Self {
        Self {
            kind,
            direction,
            name: None,
        }
    }

    /// Slot reserved for a channel of the given name
    pub fn named(kind: ChannelKind, direction: Direction, name: impl Into<String>) -> Self {
        Self {
            kind,
            direction,
            name: Some(name.into()),
        }
    }

    /// Whether the `(kind, direction)` tuples are equal
    pub fn same_tuple(&self, other: &ChannelMatch) -> bool {
        self.kind == other.kind && self.direction == other.direction
    }
}

/// Translates channel traffic into a protocol's high-level API
///
/// Wakeup handlers run on the caller's thread, possibly concurrently with
/// each other and with detach, and must not block. A handler that is not
/// implemented reports `NotBound`, the same as no driver at all.
pub trait ProtocolDriver: Send + Sync + std::fmt::Debug {
    /// Driver name, referenced by application drivers
    fn name(&self) -> &str;

    /// Shape this driver serves, position by position
    fn channels(&self) -> &[ChannelMatch];

    /// Components this driver is compatible with
    fn processes(&self) -> &[String] {
        &[]
    }

    /// Take over a bound protocol
    ///
    /// Runs with the registry lock held.
    fn probe(&self, _protocol: &Arc<Protocol>) -> Result<()> {
        Ok(())
    }

    /// Release a protocol
    ///
    /// Wakeups started after this call no longer reach the driver; ones
    /// already in flight may still complete.
    fn remove(&self, _protocol: &Protocol) {}

    /// A channel of `protocol` became ready; `channel` is its identity
    fn channel_wakeup(&self, _protocol: ProtocolId, _channel: u32) -> Result<()> {
        Err(NeuronError::NotBound)
    }

    /// The application on top of `protocol` raised `event`
    fn app_wakeup(&self, _protocol: ProtocolId, _event: u32) -> Result<()> {
        Err(NeuronError::NotBound)
    }
}

/// Glue between a protocol's API and the surrounding system
pub trait ApplicationDriver: Send + Sync + std::fmt::Debug {
    /// Driver name
    fn name(&self) -> &str;

    /// Application kind this driver serves
    fn kind_tag(&self) -> &str;

    /// Protocol driver this application speaks to, if it cares
    fn protocol_driver(&self) -> Option<&str> {
        None
    }

    /// Take over an application
    fn probe(&self, _application: &Arc<Application>) -> Result<()> {
        Ok(())
    }

    /// Release an application
    fn remove(&self, _application: &Application) {}

    /// The protocol under `application` became usable
    ///
    /// Delivered once per activation.
    fn protocol_ready(&self, _application: &Arc<Application>) {}
}

/// Whether `driver` can serve a protocol with this shape and process list
pub fn driver_matches(
    driver: &dyn ProtocolDriver,
    shape: &[ChannelMatch],
    process_names: &[String],
) -> bool {
    let table = driver.channels();
    table.len() == shape.len()
        && table.iter().zip(shape).all(|(want, have)| want.same_tuple(have))
        && process_names
            .iter()
            .all(|name| driver.processes().iter().any(|p| p == name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Table(Vec<ChannelMatch>, Vec<String>);

    impl ProtocolDriver for Table {
        fn name(&self) -> &str {
            "table"
        }

        fn channels(&self) -> &[ChannelMatch] {
            &self.0
        }

        fn processes(&self) -> &[String] {
            &self.1
        }
    }

    #[test]
    fn test_driver_matching_is_positional() {
        let driver = Table(
            vec![
                ChannelMatch::new(ChannelKind::MessageQueue, Direction::Send),
                ChannelMatch::new(ChannelKind::Notification, Direction::Receive),
            ],
            vec!["vm1".to_string()],
        );

        let shape = driver.0.clone();
        assert!(driver_matches(&driver, &shape, &[]));
        assert!(driver_matches(&driver, &shape, &["vm1".to_string()]));
        assert!(!driver_matches(&driver, &shape, &["vm2".to_string()]));

        let reversed: Vec<_> = shape.iter().rev().cloned().collect();
        assert!(!driver_matches(&driver, &reversed, &[]));
        assert!(!driver_matches(&driver, &shape[..1], &[]));
    }

    #[test]
    fn test_default_handlers_report_not_bound() {
        let driver = Table(Vec::new(), Vec::new());
        assert!(driver.channel_wakeup(1, 0).unwrap_err().is_not_bound());
        assert!(driver.app_wakeup(1, 0).unwrap_err().is_not_bound());
    }
}
