//! Person persistence boundary.
//!
//! The pipeline applies envelopes through [`PersonStore`]; it makes no storage
//! assumptions beyond plain save/find/delete semantics keyed by tax number.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use taxflow_core::{DebtAmount, DomainError, Person, PersonSnapshot, TaxNumber};

pub use in_memory::{AppliedOp, InMemoryPersonStore, StoreOp};
pub use postgres::PostgresPersonStore;

/// Persistence operation error.
///
/// ## Error Categories
///
/// - **Domain**: the store refused the change for a business reason (duplicate, missing row)
/// - **Integrity**: a constraint rejected the row
/// - **Timeout / Connection / Unavailable**: the store could not be reached in time
/// - **Query**: any other driver failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("integrity constraint violated: {0}")]
    Integrity(String),

    #[error("storage timeout: {0}")]
    Timeout(String),

    #[error("storage connection failed: {0}")]
    Connection(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Store of person rows keyed by tax number.
///
/// ## Semantics
///
/// - `create_from_event` fails with `AlreadyExists` when the tax number is taken
/// - `update_from_event`, `delete_from_event` and `add_debt` fail with `NotFound`
///   when no row exists
///
/// Both outcomes are final: the pipeline dead-letters them instead of retrying.
pub trait PersonStore: Send + Sync {
    fn create_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError>;

    fn update_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError>;

    fn delete_from_event(&self, snapshot: &PersonSnapshot) -> Result<(), PersistenceError>;

    /// Add `amount` to the person's accumulated debt.
    fn add_debt(&self, tax_number: &TaxNumber, amount: DebtAmount) -> Result<Person, PersistenceError>;

    fn find_by_tax_number(&self, tax_number: &TaxNumber) -> Result<Option<Person>, PersistenceError>;
}

impl<S> PersonStore for Arc<S>
where
    S: PersonStore + ?Sized,
{
    fn create_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        (**self).create_from_event(snapshot)
    }

    fn update_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        (**self).update_from_event(snapshot)
    }

    fn delete_from_event(&self, snapshot: &PersonSnapshot) -> Result<(), PersistenceError> {
        (**self).delete_from_event(snapshot)
    }

    fn add_debt(&self, tax_number: &TaxNumber, amount: DebtAmount) -> Result<Person, PersistenceError> {
        (**self).add_debt(tax_number, amount)
    }

    fn find_by_tax_number(&self, tax_number: &TaxNumber) -> Result<Option<Person>, PersistenceError> {
        (**self).find_by_tax_number(tax_number)
    }
}
