//! Error types for the bchgate gateway
//!
//! Only `ConfigError` is allowed to stop the process, and only before the
//! server starts accepting traffic. Everything else is recovered locally.

use thiserror::Error;

pub use crate::api::auth::CredentialError;
pub use crate::feed::decoder::DecodeError;
pub use crate::feed::registry::RegistryError;

/// Root error type for gateway startup and background tasks
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),
}

/// Upstream wire feed errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream {endpoint} unavailable: {reason}")]
    UpstreamUnavailable { endpoint: String, reason: String },

    #[error("upstream disconnected: {0}")]
    Disconnected(String),

    #[error("malformed envelope with {0} frames")]
    MalformedEnvelope(usize),

    #[error("feed source closed")]
    Closed,
}

pub type GatewayResult<T> = Result<T, GatewayError>;
