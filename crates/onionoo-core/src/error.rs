//! Error types for Onionoo core operations.
//!
//! This module defines well-structured error types using `thiserror` for
//! library-level errors, while the summary source boundary and the binary use
//! `anyhow` for convenient error handling.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using OnionooError
pub type Result<T> = std::result::Result<T, OnionooError>;

/// Core error types for Onionoo operations.
///
/// Callers distinguish two classes: invalid input (the request is at fault and
/// was rejected before filtering began) and not-ready (the engine has nothing
/// current to answer from). Mapping either class onto a transport status is the
/// caller's business.
#[derive(Error, Debug)]
pub enum OnionooError {
    // === Request Errors ===
    /// A query parameter has a malformed or out-of-range value
    #[error("invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A query parameter is not known to the engine
    #[error("unknown parameter '{name}'")]
    UnknownParameter { name: String },

    /// The requested resource path does not name a response kind
    #[error("unknown resource: {path}")]
    UnknownResource { path: String },

    // === Index Errors ===
    /// No snapshot has been published within the wait timeout
    #[error("node index not ready after waiting {waited:?}")]
    NotReady { waited: Duration },

    /// The published snapshot is older than the configured maximum age
    #[error("node index is stale: last indexed {age:?} ago")]
    IndexStale { age: Duration },

    /// A summary record failed a local invariant and cannot be indexed
    #[error("invalid summary record {fingerprint}: {reason}")]
    InvalidRecord { fingerprint: String, reason: String },

    // === Source Errors ===
    /// The summary source failed to enumerate or retrieve records
    #[error("summary source error: {reason}")]
    Source { reason: String },

    // === Configuration Errors ===
    /// Configuration file parsing failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // === Internal Errors ===
    /// Internal error that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl OnionooError {
    /// Returns true if the request itself was at fault
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            OnionooError::InvalidParameter { .. }
                | OnionooError::UnknownParameter { .. }
                | OnionooError::UnknownResource { .. }
        )
    }

    /// Returns true if no usable snapshot was available to answer from
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            OnionooError::NotReady { .. } | OnionooError::IndexStale { .. }
        )
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        OnionooError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid record error
    pub fn invalid_record(fingerprint: impl Into<String>, reason: impl Into<String>) -> Self {
        OnionooError::InvalidRecord {
            fingerprint: fingerprint.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for OnionooError {
    fn from(err: serde_json::Error) -> Self {
        OnionooError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for OnionooError {
    fn from(err: anyhow::Error) -> Self {
        OnionooError::Source {
            reason: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_invalid_input() {
        let err = OnionooError::invalid_parameter("as", "not a number");
        assert!(err.is_invalid_input());
        assert!(!err.is_not_ready());

        let err = OnionooError::UnknownParameter {
            name: "colour".to_string(),
        };
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_is_not_ready() {
        let err = OnionooError::NotReady {
            waited: Duration::from_secs(10),
        };
        assert!(err.is_not_ready());
        assert!(!err.is_invalid_input());

        let err = OnionooError::IndexStale {
            age: Duration::from_secs(7 * 3600),
        };
        assert!(err.is_not_ready());
    }

    #[test]
    fn test_display() {
        let err = OnionooError::invalid_parameter("limit", "expected at most 6 digits");
        assert_eq!(
            err.to_string(),
            "invalid value for parameter 'limit': expected at most 6 digits"
        );
    }
}
