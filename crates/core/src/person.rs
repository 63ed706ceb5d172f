//! Person entity and the snapshot carried by entity-change events.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::PersonId;
use crate::value_object::{DebtAmount, TaxNumber};

/// Entity fields as captured when a change request was accepted.
///
/// Snapshots travel inside envelopes and are never mutated after publishing;
/// only the persisted [`Person`] changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub tax_number: TaxNumber,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
}

impl PersonSnapshot {
    pub fn new(
        tax_number: TaxNumber,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        date_of_birth: NaiveDate,
    ) -> Self {
        Self {
            tax_number,
            first_name: first_name.into(),
            last_name: last_name.into(),
            date_of_birth,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.first_name.trim().is_empty() {
            return Err(DomainError::validation("first name must not be empty"));
        }
        if self.last_name.trim().is_empty() {
            return Err(DomainError::validation("last name must not be empty"));
        }
        Ok(())
    }
}

/// Persisted person with its accumulated tax debt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    id: PersonId,
    tax_number: TaxNumber,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    /// Accumulated debt in minor units.
    tax_debt: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Person {
    pub fn from_snapshot(snapshot: &PersonSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: PersonId::new(),
            tax_number: snapshot.tax_number.clone(),
            first_name: snapshot.first_name.clone(),
            last_name: snapshot.last_name.clone(),
            date_of_birth: snapshot.date_of_birth,
            tax_debt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild from stored columns.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: PersonId,
        tax_number: TaxNumber,
        first_name: String,
        last_name: String,
        date_of_birth: NaiveDate,
        tax_debt: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tax_number,
            first_name,
            last_name,
            date_of_birth,
            tax_debt,
            created_at,
            updated_at,
        }
    }

    pub fn tax_number(&self) -> &TaxNumber {
        &self.tax_number
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn date_of_birth(&self) -> NaiveDate {
        self.date_of_birth
    }

    pub fn tax_debt(&self) -> u64 {
        self.tax_debt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Replace the descriptive fields. The tax number never changes.
    pub fn update_info(&mut self, snapshot: &PersonSnapshot, now: DateTime<Utc>) {
        self.first_name = snapshot.first_name.clone();
        self.last_name = snapshot.last_name.clone();
        self.date_of_birth = snapshot.date_of_birth;
        self.updated_at = now;
    }

    pub fn add_debt(&mut self, amount: DebtAmount, now: DateTime<Utc>) {
        self.tax_debt = self.tax_debt.saturating_add(amount.cents());
        self.updated_at = now;
    }

    /// Age in whole years on `today`.
    pub fn age(&self, today: NaiveDate) -> u32 {
        let mut years = today.year() - self.date_of_birth.year();
        if (today.month(), today.day()) < (self.date_of_birth.month(), self.date_of_birth.day()) {
            years -= 1;
        }
        years.max(0) as u32
    }
}

impl Entity for Person {
    type Id = PersonId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
