//! Channel transports
//!
//! [`Transport`] is the interface a channel uses to move data. The bundled
//! implementations are in-process loopbacks for each channel kind.

pub mod doorbell;
pub mod queue;
pub mod shm;
pub mod traits;

pub use doorbell::{Doorbell, DoorbellEndpoint};
pub use queue::{MessageQueue, QueueConfig, QueueEndpoint, QueueRole, QueueStats};
pub use shm::{RegionConfig, SharedRegion};
pub use traits::{Capabilities, Transport, TransportError, TransportResult};
