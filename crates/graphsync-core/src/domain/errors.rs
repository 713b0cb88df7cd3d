//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures at the ingestion boundary and invalid
//! pass state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid external (provider-side) identifier
    #[error("Invalid external ID: {0}")]
    InvalidExternalId(String),

    /// Invalid organization identifier
    #[error("Invalid org ID: {0}")]
    InvalidOrgId(String),

    /// Invalid connector name
    #[error("Invalid connector name: {0}")]
    InvalidConnector(String),

    /// Invalid object entry received from a lister
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Invalid timestamp value (neither ISO 8601 nor epoch milliseconds)
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Invalid sync point key
    #[error("Invalid sync point key: {0}")]
    InvalidSyncPointKey(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidExternalId(String::new());
        assert_eq!(err.to_string(), "Invalid external ID: ");

        let err = DomainError::InvalidState {
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from completed to running"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidEntry("missing name".to_string());
        let err2 = DomainError::InvalidEntry("missing name".to_string());
        let err3 = DomainError::InvalidEntry("missing id".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
