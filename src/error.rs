//! Shroud error types

use thiserror::Error;

/// Result type alias for Shroud operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shroud error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Crypto errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Authentication failed")]
    AuthFailure,

    // Device errors
    #[error("Device error: {0}")]
    Device(String),

    // Socket errors
    #[error("Socket error: {0}")]
    Socket(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Lock on {0} held by another node")]
    LockHeld(String),

    // Lease errors
    #[error("Lease lost after {attempts} consecutive refresh failures")]
    LeaseLost { attempts: u32 },

    #[error("Overlay subnet exhausted: no free address in {0}")]
    SubnetExhausted(String),

    // Plugin errors
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    // Serialization errors
    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is worth retrying against the backend store
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::LockHeld(_) | Error::Io(_))
    }
}
