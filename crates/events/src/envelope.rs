use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxflow_core::{DebtAmount, DomainError, DomainResult, EventId, PersonSnapshot, TaxNumber};

use crate::event::{DebtCalculation, EventType, PersonPayload};

/// Envelope for an event moving through the broker.
///
/// This is the unit you publish, buffer and dead-letter.
///
/// Notes:
/// - `key` is the business identifier (tax number). It is both the broker
///   partitioning key and the coordination-store key.
/// - **Immutable**: there are no setters. Retry metadata travels in message
///   headers, never in the envelope.
/// - `event_id` is stable across retries and recovery, which makes it the
///   idempotency key for at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    event_id: EventId,
    event_type: EventType,
    occurred_at: DateTime<Utc>,
    key: String,
    payload: P,
}

/// The envelope shape handled by the person pipeline.
pub type PersonEnvelope = EventEnvelope<PersonPayload>;

impl<P> EventEnvelope<P> {
    pub fn new(
        event_id: EventId,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        key: impl Into<String>,
        payload: P,
    ) -> Self {
        Self {
            event_id,
            event_type,
            occurred_at,
            key: key.into(),
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Whether this event defines the entity its dependents need.
    pub fn is_creation(&self) -> bool {
        self.event_type == EventType::Create
    }
}

impl PersonEnvelope {
    pub fn create(snapshot: PersonSnapshot) -> Self {
        Self::change(EventType::Create, snapshot)
    }

    pub fn update(snapshot: PersonSnapshot) -> Self {
        Self::change(EventType::Update, snapshot)
    }

    pub fn delete(snapshot: PersonSnapshot) -> Self {
        Self::change(EventType::Delete, snapshot)
    }

    pub fn add_debt(tax_number: TaxNumber, amount: DebtAmount) -> Self {
        Self::new(
            EventId::new(),
            EventType::AddDebt,
            Utc::now(),
            tax_number.as_str(),
            PersonPayload::Debt(DebtCalculation { amount }),
        )
    }

    fn change(event_type: EventType, snapshot: PersonSnapshot) -> Self {
        let key = snapshot.tax_number.to_string();
        Self::new(
            EventId::new(),
            event_type,
            Utc::now(),
            key,
            PersonPayload::Snapshot(snapshot),
        )
    }

    /// Check the envelope is internally consistent before it is applied.
    ///
    /// Failures here are bad data: no retry can fix them.
    pub fn validate(&self) -> DomainResult<()> {
        let tax_number = TaxNumber::parse(&self.key)?;

        match (&self.event_type, &self.payload) {
            (EventType::Create | EventType::Update | EventType::Delete, PersonPayload::Snapshot(s)) => {
                if s.tax_number != tax_number {
                    return Err(DomainError::validation(format!(
                        "envelope key {} does not match snapshot tax number {}",
                        self.key, s.tax_number
                    )));
                }
                if self.event_type != EventType::Delete {
                    s.validate()?;
                }
                Ok(())
            }
            (EventType::AddDebt, PersonPayload::Debt(_)) => Ok(()),
            (event_type, _) => Err(DomainError::validation(format!(
                "payload does not match event type {event_type}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn snapshot(tax: &str) -> PersonSnapshot {
        PersonSnapshot::new(
            TaxNumber::parse(tax).unwrap(),
            "Jane",
            "Doe",
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        )
    }

    #[test]
    fn constructors_key_by_tax_number() {
        let env = PersonEnvelope::create(snapshot("TAX001"));
        assert_eq!(env.key(), "TAX001");
        assert!(env.is_creation());
        assert!(env.validate().is_ok());

        for env in [
            PersonEnvelope::update(snapshot("TAX002")),
            PersonEnvelope::delete(snapshot("TAX002")),
        ] {
            assert_eq!(env.key(), "TAX002");
            assert!(!env.is_creation());
            assert!(env.validate().is_ok());
        }

        let debt = PersonEnvelope::add_debt(
            TaxNumber::parse("TAX001").unwrap(),
            DebtAmount::from_cents(250).unwrap(),
        );
        assert_eq!(debt.event_type(), EventType::AddDebt);
        assert!(!debt.is_creation());
        assert!(debt.validate().is_ok());
    }

    #[test]
    fn mismatched_payload_is_invalid() {
        let env = PersonEnvelope::new(
            EventId::new(),
            EventType::AddDebt,
            Utc::now(),
            "TAX001",
            PersonPayload::Snapshot(snapshot("TAX001")),
        );
        assert!(matches!(env.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn key_must_match_snapshot() {
        let env = PersonEnvelope::new(
            EventId::new(),
            EventType::Update,
            Utc::now(),
            "TAX002",
            PersonPayload::Snapshot(snapshot("TAX001")),
        );
        assert!(matches!(env.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn serializes_as_json_round_trip() {
        let env = PersonEnvelope::update(snapshot("TAX003"));
        let json = serde_json::to_string(&env).unwrap();
        let back: PersonEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
