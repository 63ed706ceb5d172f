//! `taxflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod person;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EventId, PersonId};
pub use person::{Person, PersonSnapshot};
pub use value_object::{DebtAmount, TaxNumber, ValueObject};
