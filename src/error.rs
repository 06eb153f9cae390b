//! Error types and handling for neuron

use crate::transport::TransportError;

/// Result type alias for neuron operations
pub type Result<T> = std::result::Result<T, NeuronError>;

/// Error types for the binding engine
///
/// `NotBound` and `ShapeMismatch` are expected outcomes of races and of
/// order-independent registration; callers normally swallow them.
#[derive(Debug, thiserror::Error)]
pub enum NeuronError {
    /// No driver is currently attached to the entity
    #[error("no driver bound")]
    NotBound,

    /// The channel does not fit any open protocol slot
    #[error("channel {channel} does not fit any open protocol slot")]
    ShapeMismatch { channel: u64 },

    /// The slot or channel is already claimed
    #[error("duplicate binding: {what}")]
    DuplicateBinding { what: String },

    /// Segment allocation failed; nothing was left allocated
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Opaque failure reported by a transport
    #[error(transparent)]
    TransportFailure(#[from] TransportError),

    /// Entity id unknown to the registry
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: u64 },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Operation not valid for this channel
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Topology file could not be loaded
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl NeuronError {
    /// Create a shape mismatch error for a channel
    pub fn shape_mismatch(channel: u64) -> Self {
        Self::ShapeMismatch { channel }
    }

    /// Create a duplicate binding error
    pub fn duplicate(what: impl Into<String>) -> Self {
        Self::DuplicateBinding { what: what.into() }
    }

    /// Create an out-of-memory error
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: u64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a configuration error with its underlying cause
    pub fn config(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this is the expected "nobody listening" outcome of a wakeup
    pub fn is_not_bound(&self) -> bool {
        matches!(self, Self::NotBound)
    }
}

impl From<std::io::Error> for NeuronError {
    fn from(err: std::io::Error) -> Self {
        Self::TransportFailure(TransportError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = NeuronError::shape_mismatch(7);
        assert!(matches!(err, NeuronError::ShapeMismatch { channel: 7 }));

        let err = NeuronError::out_of_memory(4096);
        assert!(matches!(err, NeuronError::OutOfMemory { requested: 4096 }));

        assert!(NeuronError::NotBound.is_not_bound());
        assert!(!NeuronError::duplicate("slot 0").is_not_bound());
    }

    #[test]
    fn test_error_display() {
        let err = NeuronError::invalid_parameter("max_segment_capacity", "must be non-zero");
        let display = format!("{}", err);
        assert!(display.contains("Invalid parameter"));
        assert!(display.contains("max_segment_capacity"));

        let err: NeuronError = TransportError::WouldBlock.into();
        assert!(matches!(err, NeuronError::TransportFailure(TransportError::WouldBlock)));
    }
}
