//! Error types for the Turnstile engine.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Only configuration problems are ever surfaced by an evaluation. Backend
/// failures are folded into a [`Decision`](crate::ratelimit::Decision) by the
/// configured failure mode.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid limit spec, cost, key, or system configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        TurnstileError::Configuration(msg.into())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
