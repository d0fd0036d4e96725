//! Error types for voicelink

use thiserror::Error;

/// Result type alias for voicelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voicelink
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (serial link send/receive)
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
