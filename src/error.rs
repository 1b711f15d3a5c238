//! Bus error types.

use std::time::Duration;

use crate::serializer::SerializationError;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
///
/// Dispatch-time failures are never surfaced through this type; they are
/// reported to the bus's [`ErrorSubscriber`](crate::dispatch::ErrorSubscriber).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Type '{0}' has no registered data contract")]
    UnknownContract(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed")]
    Closed,
}

impl BusError {
    /// Returns true if this error was raised while validating setup, not at runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnknownContract(_) | Self::UnsupportedContentType(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(BusError::Configuration("bad".into()).is_configuration());
        assert!(BusError::UnknownContract("Foo".into()).is_configuration());
        assert!(!BusError::Publish("nope".into()).is_configuration());
        assert!(!BusError::Timeout(Duration::from_secs(1)).is_configuration());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = BusError::Channel("NOT_FOUND - no queue 'q'".into());
        assert_eq!(err.to_string(), "Channel error: NOT_FOUND - no queue 'q'");
    }
}
