//! Error types for model image parsing

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors that can occur while parsing or building a model image
#[derive(Debug, Error)]
pub enum ModelError {
    /// File not found or cannot be read
    #[error("Model file not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Image shorter than a section it declares
    #[error("Model image truncated: {section} needs {needed} bytes, have {actual}")]
    Truncated {
        /// Section being read
        section: &'static str,
        /// Bytes the section requires
        needed: u64,
        /// Bytes available
        actual: u64,
    },

    /// Header does not start with the model magic
    #[error("Invalid model header: expected magic \"TNPM\"")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported model format version: {version}")]
    UnsupportedVersion {
        /// Version found in the header
        version: u16,
    },

    /// A header or metadata field carries an unknown value
    #[error("Invalid model field {field}: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// Metadata parsing failed
    #[error("Failed to parse model metadata: {reason}")]
    ParseError {
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
    /// Create a parse error
    pub fn parse_error(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a truncation error
    pub fn truncated(section: &'static str, needed: u64, actual: u64) -> Self {
        Self::Truncated {
            section,
            needed,
            actual,
        }
    }
}
