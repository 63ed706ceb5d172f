//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// existence conflicts). Retrying any of these can never succeed, which is why
/// the message pipeline treats every variant as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A person with this tax number is already registered.
    #[error("person with tax number {0} already exists")]
    AlreadyExists(String),

    /// A definitive lookup found nothing.
    #[error("person with tax number {0} not found")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn already_exists(tax_number: impl Into<String>) -> Self {
        Self::AlreadyExists(tax_number.into())
    }

    pub fn not_found(tax_number: impl Into<String>) -> Self {
        Self::NotFound(tax_number.into())
    }
}
