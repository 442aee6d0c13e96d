//! Error types for the duplication engine.
//!
//! Configuration errors reject the single offending directive at load time;
//! dispatch errors are counted and dropped; nothing here ever propagates to
//! the primary request path.

use thiserror::Error;

/// A configuration directive was invalid. The rule store is left unchanged.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regular expression `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("invalid duplication percentage `{0}` (expected an integer between 0 and 100)")]
    InvalidPercentage(String),

    #[error("invalid minimum/maximum {what}: {min}/{max}")]
    InvalidBounds {
        what: &'static str,
        min: usize,
        max: usize,
    },

    #[error("invalid {what} value `{value}`. Supported values: {supported}")]
    InvalidValue {
        what: &'static str,
        value: String,
        supported: &'static str,
    },

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("pool configuration cannot change after start")]
    PoolRunning,
}

impl ConfigError {
    pub(crate) fn invalid_pattern(pattern: &str, source: regex::Error) -> Self {
        ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source: Box::new(source),
        }
    }
}

/// The dispatch pool rejected an operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// `push` was called after `stop` (or before `start` finished wiring).
    #[error("dispatch pool is stopped")]
    Stopped,
}

/// An outbound duplicate call failed. Counted, logged, and dropped.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("outbound request to `{destination}` timed out after {timeout_ms}ms")]
    Timeout {
        destination: String,
        timeout_ms: u64,
    },

    #[error("outbound request to `{destination}` failed: {source}")]
    Connect {
        destination: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid destination `{0}`")]
    InvalidDestination(String),
}

/// The length-prefixed answer envelope could not be parsed.
///
/// A hard failure for the single request carrying the envelope (the HTTP 400
/// equivalent), never fatal to the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid length field `{0}`")]
    BadLength(String),

    #[error("envelope truncated: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
}
