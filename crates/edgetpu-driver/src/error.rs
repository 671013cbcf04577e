//! Error types for Edge TPU driver operations

use std::path::PathBuf;
use thiserror::Error;

use edgetpu_models::ModelError;

/// Result type alias for Edge TPU operations
pub type Result<T> = std::result::Result<T, EdgeTpuError>;

/// Errors that can occur during Edge TPU operations
#[derive(Debug, Error)]
pub enum EdgeTpuError {
    /// File not found at the expected path
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// A USB transfer failed or was rejected by the transport
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// A transfer completion did not arrive in time
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// A poll-until-condition loop ran out of attempts
    #[error("Register {offset:#x} did not reach {condition} after {attempts} reads")]
    PollExhausted {
        /// Register being polled
        offset: u64,
        /// Expected condition
        condition: &'static str,
        /// Reads performed
        attempts: u32,
    },

    /// Endpoint required by the protocol is not open
    #[error("Endpoint {address:#04x} unavailable: {reason}")]
    EndpointUnavailable {
        /// `bEndpointAddress`
        address: u8,
        /// Reason for failure
        reason: String,
    },

    /// `omc0_00.chip_id` is not the expected value
    #[error("Chip id mismatch: expected {expected:#x}, found {found:#x}")]
    ChipIdMismatch {
        /// Expected chip id
        expected: u16,
        /// Chip id read from the device
        found: u16,
    },

    /// Device answered, but not the way the protocol requires
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for failure
        reason: String,
    },

    /// Firmware readback differs from the uploaded image
    #[error("Firmware verification failed at byte {offset}")]
    FirmwareMismatch {
        /// First differing byte
        offset: usize,
    },

    /// Buffer allocation failed
    #[error("Resource exhausted: {reason}")]
    Resource {
        /// Reason for failure
        reason: String,
    },

    /// Caller-supplied buffer or argument is unusable
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for failure
        reason: String,
    },

    /// Task or device is in a state that does not allow the operation
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// No Edge TPU transport is connected
    #[error("No Edge TPU connected")]
    NotConnected,

    /// Configuration value could not be parsed
    #[error("Invalid configuration for {key}: {reason}")]
    Config {
        /// Setting name
        key: String,
        /// Reason for failure
        reason: String,
    },

    /// Package or layer error
    #[error("Model error: {source}")]
    Model {
        /// Underlying model error
        #[from]
        source: ModelError,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl EdgeTpuError {
    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create an endpoint unavailable error
    pub fn endpoint_unavailable(address: u8, reason: impl Into<String>) -> Self {
        Self::EndpointUnavailable {
            address,
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a resource error
    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a configuration error
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Error for a poisoned lock
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::invalid_state(format!("{what} lock poisoned"))
    }

    /// True for transport-level failures (including timeouts).
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransferFailed { .. } | Self::Timeout { .. } | Self::EndpointUnavailable { .. }
        )
    }

    /// True if the error is a timeout of any kind.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::PollExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_display() {
        let err = EdgeTpuError::timeout(Duration::from_millis(200));
        assert_eq!(err.to_string(), "Operation timeout after 200ms");
        assert!(err.is_timeout());
        assert!(err.is_transport());
    }

    #[test]
    fn test_chip_id_display() {
        let err = EdgeTpuError::ChipIdMismatch {
            expected: 0x89A,
            found: 0x123,
        };
        assert_eq!(err.to_string(), "Chip id mismatch: expected 0x89a, found 0x123");
        assert!(!err.is_transport());
    }

    #[test]
    fn test_model_error_converts() {
        let err: EdgeTpuError = ModelError::NoInferenceExecutable.into();
        assert!(matches!(err, EdgeTpuError::Model { .. }));
    }
}
