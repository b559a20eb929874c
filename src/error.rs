//! Error types for the Turnstile admission-control layer.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Only configuration and policy-construction failures surface here; every
/// runtime fault inside the admission path is handled locally with the
/// fail-open policy and an audit record, never propagated to callers.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid rate limit policy parameters
    #[error("Policy error: {0}")]
    Policy(#[from] crate::ratelimit::PolicyError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
