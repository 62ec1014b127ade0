//! Error types for pc-proxy

use std::time::Duration;

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Invalid server state: {0}")]
    State(String),

    #[error("{listener} listener did not shut down within {timeout:?}")]
    ShutdownTimeout {
        listener: &'static str,
        timeout: Duration,
    },
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn logging(msg: impl Into<String>) -> Self {
        Error::Logging(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
