//! Failure taxonomy shared by every consumer stage.
//!
//! One pure mapping decides whether a failure can ever succeed on retry. The
//! batch engine, the retry workers and the buffer drain all call [`classify`];
//! there is no per-stage override.

use taxflow_core::DomainError;

use crate::persistence::PersistenceError;

/// Whether retrying a failed record can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad data or a logic conflict: dead-letter immediately.
    Fatal,
    /// Transient infrastructure failure: escalate through the retry chain.
    Retryable,
}

/// A failure while applying one envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The record could not be decoded into an envelope.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Context added on the way up; classification looks through it.
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<ProcessingError>,
    },

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl ProcessingError {
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost cause, skipping every `Wrapped` layer.
    pub fn root_cause(&self) -> &ProcessingError {
        let mut current = self;
        while let ProcessingError::Wrapped { source, .. } = current {
            current = source;
        }
        current
    }
}

/// Map a failure to its retry class.
///
/// - FATAL: malformed payloads, every [`DomainError`] (validation, already
///   exists, not found) and persistence integrity violations.
/// - RETRYABLE: timeouts, connection failures, unavailable storage.
/// - Anything unrecognised is RETRYABLE so a glitch never drops a record.
pub fn classify(err: &ProcessingError) -> ErrorKind {
    match err.root_cause() {
        ProcessingError::Malformed(_) | ProcessingError::Domain(_) => ErrorKind::Fatal,
        ProcessingError::Persistence(p) => classify_persistence(p),
        ProcessingError::Unexpected(_) | ProcessingError::Wrapped { .. } => ErrorKind::Retryable,
    }
}

fn classify_persistence(err: &PersistenceError) -> ErrorKind {
    match err {
        PersistenceError::Domain(_) | PersistenceError::Integrity(_) => ErrorKind::Fatal,
        PersistenceError::Timeout(_)
        | PersistenceError::Connection(_)
        | PersistenceError::Unavailable(_)
        | PersistenceError::Query(_) => ErrorKind::Retryable,
    }
}
