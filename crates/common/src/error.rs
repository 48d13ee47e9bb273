//! Common error types for CARP components.

use std::fmt;

/// A specialized Result type for CARP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CARP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CARP error: {0}")]
    Carp(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new CARP error.
    pub fn carp(msg: impl fmt::Display) -> Self {
        Error::Carp(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
