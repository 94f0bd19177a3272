//! Error types for the edge proxy

use std::io;

use thiserror::Error;

/// Result type alias for the edge proxy.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level gateway errors (startup, configuration, lifecycle).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Routing table could not be built.
    #[error("Routing error: {0}")]
    Routing(#[from] crate::routing::RoutingError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
