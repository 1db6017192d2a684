//! Error types for configuration parsing and validation.

use std::path::PathBuf;

use thiserror::Error;
use vigil_types::AddressError;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A directive line could not be parsed.
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A directive references a primary no `monitor` line declared.
    #[error("line {line}: no such primary: {name}")]
    NoSuchPrimary { line: usize, name: String },

    /// Two `monitor` lines declared the same name.
    #[error("duplicate primary: {0}")]
    Duplicate(String),

    /// `monitor` quorum must be at least 1.
    #[error("primary {0}: quorum must be positive")]
    QuorumMustBePositive(String),

    /// A configured script path is missing or not executable.
    #[error("script is not executable: {0}")]
    NonExecutableScript(PathBuf),

    /// Address resolution failed for a `monitor` line.
    #[error("line {line}: {source}")]
    Address {
        line: usize,
        #[source]
        source: AddressError,
    },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
