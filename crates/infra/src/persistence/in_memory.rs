use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::Utc;

use taxflow_core::{DebtAmount, DomainError, Person, PersonSnapshot, TaxNumber};

use super::{PersistenceError, PersonStore};

/// Store operation, used for fault injection and history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Update,
    Delete,
    AddDebt,
}

/// A successfully applied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOp {
    pub op: StoreOp,
    pub tax_number: String,
    /// Debt in cents after the operation (0 for deletes).
    pub tax_debt: u64,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    tax_number: String,
    /// `None` fails forever.
    remaining: Option<u32>,
    error: PersistenceError,
}

/// In-memory person store.
///
/// Intended for tests/dev. Supports injecting failures per operation and key,
/// and records every attempt and every applied change in order.
#[derive(Debug, Default)]
pub struct InMemoryPersonStore {
    rows: RwLock<HashMap<TaxNumber, Person>>,
    faults: Mutex<Vec<Fault>>,
    attempts: Mutex<Vec<(StoreOp, String)>>,
    history: Mutex<Vec<AppliedOp>>,
}

impl InMemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` for `tax_number` with `error`.
    pub fn fail_next(&self, op: StoreOp, tax_number: &str, times: u32, error: PersistenceError) {
        self.push_fault(Fault {
            op,
            tax_number: tax_number.to_string(),
            remaining: Some(times),
            error,
        });
    }

    /// Fail every call of `op` for `tax_number` with `error`.
    pub fn fail_always(&self, op: StoreOp, tax_number: &str, error: PersistenceError) {
        self.push_fault(Fault {
            op,
            tax_number: tax_number.to_string(),
            remaining: None,
            error,
        });
    }

    /// Remove every injected fault.
    pub fn heal(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    /// Applied changes in application order.
    pub fn history(&self) -> Vec<AppliedOp> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Applied operations for one tax number, in order.
    pub fn applied_for(&self, tax_number: &str) -> Vec<StoreOp> {
        self.history()
            .into_iter()
            .filter(|a| a.tax_number == tax_number)
            .map(|a| a.op)
            .collect()
    }

    /// How many times `op` was attempted for `tax_number` (successful or not).
    pub fn attempts(&self, op: StoreOp, tax_number: &str) -> usize {
        self.attempts
            .lock()
            .map(|a| {
                a.iter()
                    .filter(|(o, t)| *o == op && t == tax_number)
                    .count()
            })
            .unwrap_or(0)
    }

    fn push_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(fault);
        }
    }

    fn enter(&self, op: StoreOp, tax_number: &TaxNumber) -> Result<(), PersistenceError> {
        self.attempts
            .lock()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?
            .push((op, tax_number.to_string()));

        let mut faults = self
            .faults
            .lock()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?;

        let Some(idx) = faults
            .iter()
            .position(|f| f.op == op && f.tax_number == tax_number.as_str())
        else {
            return Ok(());
        };

        let error = faults[idx].error.clone();
        match faults[idx].remaining {
            None => {}
            Some(n) if n <= 1 => {
                faults.remove(idx);
            }
            Some(n) => faults[idx].remaining = Some(n - 1),
        }
        Err(error)
    }

    fn record(&self, op: StoreOp, tax_number: &TaxNumber, tax_debt: u64) {
        if let Ok(mut history) = self.history.lock() {
            history.push(AppliedOp {
                op,
                tax_number: tax_number.to_string(),
                tax_debt,
            });
        }
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TaxNumber, Person>>, PersistenceError> {
        self.rows
            .write()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))
    }
}

impl PersonStore for InMemoryPersonStore {
    fn create_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        self.enter(StoreOp::Create, &snapshot.tax_number)?;

        let mut rows = self.write()?;
        if rows.contains_key(&snapshot.tax_number) {
            return Err(DomainError::already_exists(snapshot.tax_number.as_str()).into());
        }

        let person = Person::from_snapshot(snapshot, Utc::now());
        rows.insert(snapshot.tax_number.clone(), person.clone());
        drop(rows);

        self.record(StoreOp::Create, &snapshot.tax_number, 0);
        Ok(person)
    }

    fn update_from_event(&self, snapshot: &PersonSnapshot) -> Result<Person, PersistenceError> {
        self.enter(StoreOp::Update, &snapshot.tax_number)?;

        let mut rows = self.write()?;
        let person = rows
            .get_mut(&snapshot.tax_number)
            .ok_or_else(|| DomainError::not_found(snapshot.tax_number.as_str()))?;
        person.update_info(snapshot, Utc::now());
        let updated = person.clone();
        drop(rows);

        self.record(StoreOp::Update, &snapshot.tax_number, updated.tax_debt());
        Ok(updated)
    }

    fn delete_from_event(&self, snapshot: &PersonSnapshot) -> Result<(), PersistenceError> {
        self.enter(StoreOp::Delete, &snapshot.tax_number)?;

        let mut rows = self.write()?;
        if rows.remove(&snapshot.tax_number).is_none() {
            return Err(DomainError::not_found(snapshot.tax_number.as_str()).into());
        }
        drop(rows);

        self.record(StoreOp::Delete, &snapshot.tax_number, 0);
        Ok(())
    }

    fn add_debt(&self, tax_number: &TaxNumber, amount: DebtAmount) -> Result<Person, PersistenceError> {
        self.enter(StoreOp::AddDebt, tax_number)?;

        let mut rows = self.write()?;
        let person = rows
            .get_mut(tax_number)
            .ok_or_else(|| DomainError::not_found(tax_number.as_str()))?;
        person.add_debt(amount, Utc::now());
        let updated = person.clone();
        drop(rows);

        self.record(StoreOp::AddDebt, tax_number, updated.tax_debt());
        Ok(updated)
    }

    fn find_by_tax_number(&self, tax_number: &TaxNumber) -> Result<Option<Person>, PersistenceError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| PersistenceError::Unavailable("lock poisoned".to_string()))?;
        Ok(rows.get(tax_number).cloned())
    }
}
