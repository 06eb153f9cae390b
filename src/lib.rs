//! # Neuron - Channel, Protocol and Application Binding Engine
//!
//! Neuron connects three layers of an inter-VM communication stack:
//!
//! - **Channels**: directional endpoints advertised by transports (message
//!   queues, notification doorbells, shared-memory regions)
//! - **Protocols**: ordered sets of channels with a required shape, served by
//!   a protocol driver once every slot is filled
//! - **Applications**: consumers of a protocol's API, handled by an
//!   application driver
//!
//! ## Features
//!
//! - **Order-independent registration**: channels queue until a fitting
//!   protocol appears; drivers attach whenever their match table fits
//! - **Lock-free wakeups**: drivers are published through RCU slots, so the
//!   notify path never takes a lock and never sees a freed driver
//! - **Segmented buffers**: large messages are split across bounded segments
//!   from pluggable allocators
//! - **Topology files**: TOML descriptions of a whole deployment
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                Application driver               │
//! ├─────────────────────────────────────────────────┤
//! │  Application ──wakeup──▶ Protocol driver        │
//! │                              ▲                  │
//! │  Channel[0] ──wakeup─────────┤                  │
//! │  Channel[n] ──wakeup─────────┘                  │
//! └─────────────────────────────────────────────────┘
//!           │                         │
//!           ▼                         ▼
//! ┌─────────────────┐    ┌─────────────────────────┐
//! │   Transports    │    │   Segmented buffers     │
//! │ queue/doorbell/ │    │   (pool, heap, budget)  │
//! │  shared memory  │    │                         │
//! └─────────────────┘    └─────────────────────────┘
//! ```

// Core modules
pub mod error;
pub mod config;
pub mod allocators;
pub mod buffers;
pub mod sync;

// Binding layers
pub mod channel;
pub mod protocol;
pub mod application;
pub mod wakeup;
pub mod bus;

// Transports and deployment description
pub mod transport;
pub mod topology;

// Main API re-exports
pub use bus::{Bus, BusStats};
pub use error::{NeuronError, Result};
pub use config::{BusConfig, BusConfigBuilder, MatchPolicy, SegmentConfig};
pub use allocators::{Allocator, AllocatorExt, BudgetAllocator, HeapAllocator, PoolAllocator};
pub use buffers::{AllocFlags, AllocationStats, BufferRange, SegmentAllocator, SegmentedBuffer};
pub use channel::{Channel, ChannelDescriptor, ChannelId, ChannelKind, ChannelLimits, Direction};
pub use protocol::{
    ApplicationDriver, ChannelMatch, Protocol, ProtocolConfig, ProtocolDriver, ProtocolId,
    ProtocolState, Signal, SignalDriver,
};
pub use application::{Application, ApplicationId};
pub use wakeup::{notify, WakeupCounts, WakeupTarget};
pub use transport::{
    Doorbell, MessageQueue, QueueConfig, RegionConfig, SharedRegion, Transport, TransportError,
};
pub use topology::{Loopback, Topology};
pub use sync::{EpochDomain, EventNotifier};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
