//! Error types and handling for the quiesce library

use thiserror::Error;

/// Result type alias for quiesce operations
pub type Result<T> = std::result::Result<T, QuiesceError>;

/// Main error type for the quiesce library
///
/// Construction and configuration failures only. Runtime conditions that
/// are part of normal flow control — a full ring, an empty ring, a lost
/// trylock — are value-encoded in the operation's return type instead.
#[derive(Error, Debug)]
pub enum QuiesceError {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A requested capacity cannot be represented or allocated
    #[error("Capacity error: {message}")]
    Capacity {
        /// Error message describing the capacity issue
        message: String,
    },
}

impl QuiesceError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new capacity error
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by retrying with different
    /// parameters
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::QuiesceError::config(format!($($arg)*))
    };
}
