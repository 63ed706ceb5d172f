//! Applies person envelopes to the store, at most once per event id.

use tracing::{debug, warn};

use taxflow_core::TaxNumber;
use taxflow_events::{EventType, PersonEnvelope, PersonPayload};

use crate::coordination::{CoordinationError, CoordinationStore, RetryStateStore};
use crate::persistence::PersonStore;
use crate::retry::ProcessingError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event id was already applied; nothing was done.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The event itself failed; classify and route it.
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    /// The coordination store is unreachable; the batch must not be acknowledged.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Maps an envelope onto the matching [`PersonStore`] call.
///
/// - `Create` → `create_from_event`, `Update` → `update_from_event`,
///   `Delete` → `delete_from_event`, `AddDebt` → `add_debt`
/// - the envelope is validated first (invalid envelopes fail as domain errors)
/// - an idempotency marker is written after each successful apply, so a
///   redelivered event is skipped
#[derive(Debug, Clone)]
pub struct EventApplier<S, C> {
    store: S,
    state: RetryStateStore<C>,
}

impl<S, C> EventApplier<S, C>
where
    S: PersonStore,
    C: CoordinationStore,
{
    pub fn new(store: S, state: RetryStateStore<C>) -> Self {
        Self { store, state }
    }

    pub fn apply(&self, envelope: &PersonEnvelope) -> Result<ApplyOutcome, ApplyError> {
        if self.state.is_processed(envelope.event_id())? {
            debug!(
                key = %envelope.key(),
                event_id = %envelope.event_id(),
                "event already applied; skipping"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        self.dispatch(envelope)
            .map_err(|e| e.wrap(format!("applying {} for {}", envelope.event_type(), envelope.key())))?;

        if let Err(err) = self.state.mark_processed(envelope.event_id()) {
            warn!(
                key = %envelope.key(),
                event_id = %envelope.event_id(),
                error = %err,
                "applied event but failed to record idempotency marker"
            );
        }

        Ok(ApplyOutcome::Applied)
    }

    fn dispatch(&self, envelope: &PersonEnvelope) -> Result<(), ProcessingError> {
        envelope.validate()?;

        match (envelope.event_type(), envelope.payload()) {
            (EventType::Create, PersonPayload::Snapshot(s)) => {
                self.store.create_from_event(s)?;
            }
            (EventType::Update, PersonPayload::Snapshot(s)) => {
                self.store.update_from_event(s)?;
            }
            (EventType::Delete, PersonPayload::Snapshot(s)) => {
                self.store.delete_from_event(s)?;
            }
            (EventType::AddDebt, PersonPayload::Debt(calc)) => {
                let tax_number = TaxNumber::parse(envelope.key())?;
                self.store.add_debt(&tax_number, calc.amount)?;
            }
            (event_type, _) => {
                return Err(ProcessingError::Malformed(format!(
                    "payload does not match event type {event_type}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::persistence::{InMemoryPersonStore, PersistenceError, StoreOp};
    use crate::retry::{classify, ErrorKind};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;
    use taxflow_core::{DebtAmount, PersonSnapshot};

    fn applier() -> (
        Arc<InMemoryPersonStore>,
        EventApplier<Arc<InMemoryPersonStore>, Arc<InMemoryCoordinationStore>>,
    ) {
        let store = Arc::new(InMemoryPersonStore::new());
        let state = RetryStateStore::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Duration::from_secs(3600),
        );
        (store.clone(), EventApplier::new(store, state))
    }

    fn snapshot(tax: &str) -> PersonSnapshot {
        PersonSnapshot::new(
            TaxNumber::parse(tax).unwrap(),
            "Jane",
            "Doe",
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        )
    }

    #[test]
    fn each_event_type_reaches_its_store_operation() {
        let (store, applier) = applier();
        let tax = TaxNumber::parse("TAX001").unwrap();

        applier.apply(&PersonEnvelope::create(snapshot("TAX001"))).unwrap();
        applier.apply(&PersonEnvelope::update(snapshot("TAX001"))).unwrap();
        applier
            .apply(&PersonEnvelope::add_debt(tax.clone(), DebtAmount::from_cents(99).unwrap()))
            .unwrap();
        applier.apply(&PersonEnvelope::delete(snapshot("TAX001"))).unwrap();

        assert_eq!(
            store.applied_for("TAX001"),
            vec![StoreOp::Create, StoreOp::Update, StoreOp::AddDebt, StoreOp::Delete]
        );
    }

    #[test]
    fn redelivered_event_is_applied_once() {
        let (store, applier) = applier();
        let create = PersonEnvelope::create(snapshot("TAX002"));

        assert_eq!(applier.apply(&create).unwrap(), ApplyOutcome::Applied);
        assert_eq!(applier.apply(&create).unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(store.attempts(StoreOp::Create, "TAX002"), 1);
    }

    #[test]
    fn failures_keep_their_classification_through_the_context() {
        let (store, applier) = applier();
        store.fail_next(
            StoreOp::Create,
            "TAX003",
            1,
            PersistenceError::Timeout("injected".into()),
        );

        let err = applier
            .apply(&PersonEnvelope::create(snapshot("TAX003")))
            .unwrap_err();
        let ApplyError::Processing(err) = err else {
            panic!("expected processing error");
        };
        assert!(err.to_string().contains("applying CREATE for TAX003"));
        assert_eq!(classify(&err), ErrorKind::Retryable);

        let err = applier
            .apply(&PersonEnvelope::update(snapshot("TAX004")))
            .unwrap_err();
        let ApplyError::Processing(err) = err else {
            panic!("expected processing error");
        };
        assert_eq!(classify(&err), ErrorKind::Fatal);
    }

    #[test]
    fn failed_events_are_not_marked_processed() {
        let (store, applier) = applier();
        store.fail_next(
            StoreOp::Create,
            "TAX005",
            1,
            PersistenceError::Connection("reset".into()),
        );
        let create = PersonEnvelope::create(snapshot("TAX005"));

        assert!(applier.apply(&create).is_err());
        assert_eq!(applier.apply(&create).unwrap(), ApplyOutcome::Applied);
    }
}
