//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures detected before any storage
/// round trip (validation, identifiers). Storage concerns belong in infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. an oversized key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was rejected (e.g. a table prefix with illegal characters).
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::InvalidIdentifier(msg.into())
    }
}
