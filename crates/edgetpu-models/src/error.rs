//! Error types for package decoding and output relayout

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while decoding packages or laying out outputs
#[derive(Debug, Error)]
pub enum ModelError {
    /// Package file not found
    #[error("Package file not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Buffer is not a well-formed `FlatBuffers` table tree
    #[error("Malformed package: {reason}")]
    Malformed {
        /// Reason for failure
        reason: String,
    },

    /// A required field is missing
    #[error("{table} is missing required field '{field}'")]
    MissingField {
        /// Table name
        table: &'static str,
        /// Field name
        field: &'static str,
    },

    /// Enum field holds a value outside its range
    #[error("{field} has unknown value {value}")]
    UnknownValue {
        /// Field name
        field: &'static str,
        /// Raw value
        value: i64,
    },

    /// Package does not contain an executable that can run inference
    #[error("Package has no inference executable")]
    NoInferenceExecutable,

    /// Layer geometry is inconsistent with a buffer
    #[error("Invalid layer '{name}': {reason}")]
    InvalidLayer {
        /// Layer name
        name: String,
        /// Reason for failure
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl ModelError {
    /// Create a malformed-buffer error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Create an invalid layer error
    pub fn invalid_layer(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing-field error
    pub const fn missing(table: &'static str, field: &'static str) -> Self {
        Self::MissingField { table, field }
    }
}
