//! Error types for desktop-analytics-core

use thiserror::Error;

use crate::client::BackendKind;

/// Main error type for the desktop-analytics-core library
#[derive(Error, Debug)]
pub enum Error {
    /// A session is already live in this process
    #[error("you can only construct a single analytics session")]
    AlreadyConstructed,

    /// Explicit host override on a backend that cannot be redirected
    #[error("the {backend} backend does not support a host override")]
    HostNotSupported { backend: BackendKind },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tracking call made after the session was shut down
    #[error("the analytics session has been shut down")]
    SessionClosed,

    /// Empty key passed for an application property
    #[error("property key must not be empty")]
    InvalidPropertyKey,

    /// Backend used before `initialize`
    #[error("analytics client used before initialize")]
    NotInitialized,

    /// Transport/delivery error
    #[error("delivery error: {0}")]
    Delivery(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result type alias for desktop-analytics-core
pub type Result<T> = std::result::Result<T, Error>;
