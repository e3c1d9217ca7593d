//! Error types for the LDAP proxy
//!
//! `RelayError` covers everything that can go wrong while relaying a request or
//! keeping the upstream registry healthy. `ConfigError` is only produced while
//! loading and validating the configuration file and is always fatal.

use std::io;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration problems (bad upstream URL, unknown scheme, invalid file)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No upstream endpoint is currently marked up
    #[error("No healthy servers found")]
    NoHealthyServers,

    /// Opening a connection to an upstream endpoint failed
    #[error("Could not connect to {address}: {message}")]
    Dial { address: String, message: String },

    /// The upstream answered with a non-success result code
    #[error("Upstream rejected request with result code {code}: {message}")]
    Rejected { code: u32, message: String },

    /// The upstream connection failed while a request was in flight
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Local socket errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Create a dial error for an endpoint address
    pub fn dial<A: Into<String>, M: ToString>(address: A, message: M) -> Self {
        RelayError::Dial {
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Create an upstream transport error
    pub fn upstream<M: ToString>(message: M) -> Self {
        RelayError::Upstream(message.to_string())
    }
}

impl ConfigError {
    pub fn invalid_url<U: Into<String>, R: Into<String>>(url: U, reason: R) -> Self {
        ConfigError::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
