//! Error types for the Hivegate engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Hivegate operations.
///
/// None of these variants are produced on the request path: `evaluate`
/// always yields a decision. They surface from startup, configuration
/// loading and policy reloads.
#[derive(Error, Debug)]
pub enum HivegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Invalid rate limit policy
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Policy file parse errors
    #[error("Policy parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rate limit policy that can never be enforced correctly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("policy `{0}` has no windows")]
    NoWindows(String),

    #[error("policy `{0}` has a zero-length window")]
    ZeroLengthWindow(String),

    #[error("policy `{policy}` allows zero requests per {window}")]
    ZeroMaxRequests { policy: String, window: String },

    #[error("policy `{policy}` declares the {window} window twice")]
    DuplicateWindow { policy: String, window: String },

    #[error("policy `{0}` has a burst size below 1")]
    ZeroBurst(String),

    #[error("policy `{policy}` has an invalid refill rate {rate}")]
    InvalidRefillRate { policy: String, rate: f64 },

    #[error("`{owner}` has an invalid {field} {value}")]
    InvalidMultiplier {
        owner: String,
        field: &'static str,
        value: f64,
    },

    #[error("invalid window `{0}` (expected second, minute, hour, day or `<n>s`)")]
    InvalidWindow(String),
}

/// Result type alias for Hivegate operations.
pub type Result<T> = std::result::Result<T, HivegateError>;
