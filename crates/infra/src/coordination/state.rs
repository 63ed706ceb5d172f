//! Per-key retry state kept in the coordination store.
//!
//! Layout:
//!
//! | key | type | meaning |
//! |-----|------|---------|
//! | `person:state:{key}` | string | `RETRYING` or `DLT`, absent when idle |
//! | `person:buffer:{key}` | list | JSON envelopes waiting behind a retry |
//! | `person:processed:{event_id}` | string | idempotency marker |
//!
//! State and buffer share one TTL so an abandoned key cannot leak forever.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use taxflow_core::EventId;
use taxflow_events::{Headers, PersonEnvelope};

use super::{CoordinationError, CoordinationStore};

const STATE_PREFIX: &str = "person:state:";
const BUFFER_PREFIX: &str = "person:buffer:";
const PROCESSED_PREFIX: &str = "person:processed:";

/// How long an applied event id is remembered.
pub const PROCESSED_TTL: Duration = Duration::from_secs(24 * 3600);

/// Retry state of a key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// A predecessor is travelling the retry chain.
    Retrying,
    /// The key's creation failed for good; dependents cannot succeed.
    Dlt,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Retrying => "RETRYING",
            KeyState::Dlt => "DLT",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RETRYING" => Some(KeyState::Retrying),
            "DLT" => Some(KeyState::Dlt),
            _ => None,
        }
    }
}

/// An envelope parked behind a retry, with the headers it arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub envelope: PersonEnvelope,
    #[serde(default)]
    pub headers: Headers,
}

impl BufferedEvent {
    pub fn new(envelope: PersonEnvelope, headers: Headers) -> Self {
        Self { envelope, headers }
    }
}

/// Typed access to the state flag, buffer and idempotency markers.
#[derive(Debug, Clone)]
pub struct RetryStateStore<C> {
    store: C,
    ttl: Duration,
}

impl<C: CoordinationStore> RetryStateStore<C> {
    pub fn new(store: C, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn state(&self, key: &str) -> Result<Option<KeyState>, CoordinationError> {
        let raw = self.store.get(&state_key(key))?;
        Ok(raw.as_deref().and_then(KeyState::parse))
    }

    pub fn mark_retrying(&self, key: &str) -> Result<(), CoordinationError> {
        self.set_state(key, KeyState::Retrying)
    }

    pub fn mark_dlt(&self, key: &str) -> Result<(), CoordinationError> {
        self.set_state(key, KeyState::Dlt)
    }

    pub fn clear_state(&self, key: &str) -> Result<(), CoordinationError> {
        self.store.delete(&state_key(key))
    }

    fn set_state(&self, key: &str, state: KeyState) -> Result<(), CoordinationError> {
        self.store.set_with_ttl(&state_key(key), state.as_str(), self.ttl)
    }

    /// Append events to the key's buffer, preserving their order.
    pub fn buffer(&self, key: &str, events: &[BufferedEvent]) -> Result<(), CoordinationError> {
        let encoded = events
            .iter()
            .map(|e| {
                serde_json::to_string(e)
                    .map_err(|err| CoordinationError::Serialization(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.store.push_back(&buffer_key(key), &encoded, self.ttl)
    }

    /// The oldest buffered event, left in place.
    ///
    /// The head is only removed by [`advance_buffer`](Self::advance_buffer) once
    /// the caller has applied or re-routed it. An entry that no longer decodes
    /// stays at the head and is reported as a serialization error.
    pub fn peek_buffered(&self, key: &str) -> Result<Option<BufferedEvent>, CoordinationError> {
        let Some(raw) = self.store.peek_front(&buffer_key(key))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|err| {
            error!(key = %key, error = %err, "undecodable buffered event blocks the key");
            CoordinationError::Serialization(format!("buffered event for {key}: {err}"))
        })
    }

    /// Remove the head returned by the last [`peek_buffered`](Self::peek_buffered).
    pub fn advance_buffer(&self, key: &str) -> Result<(), CoordinationError> {
        self.store.pop_front(&buffer_key(key)).map(|_| ())
    }

    pub fn buffered_len(&self, key: &str) -> Result<usize, CoordinationError> {
        self.store.list_len(&buffer_key(key))
    }

    pub fn clear_buffer(&self, key: &str) -> Result<(), CoordinationError> {
        self.store.delete(&buffer_key(key))
    }

    pub fn is_processed(&self, event_id: EventId) -> Result<bool, CoordinationError> {
        self.store.exists(&processed_key(event_id))
    }

    pub fn mark_processed(&self, event_id: EventId) -> Result<(), CoordinationError> {
        self.store
            .set_with_ttl(&processed_key(event_id), "1", PROCESSED_TTL)
    }
}

fn state_key(key: &str) -> String {
    format!("{STATE_PREFIX}{key}")
}

fn buffer_key(key: &str) -> String {
    format!("{BUFFER_PREFIX}{key}")
}

fn processed_key(event_id: EventId) -> String {
    format!("{PROCESSED_PREFIX}{event_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use chrono::NaiveDate;
    use std::sync::Arc;
    use taxflow_core::{PersonSnapshot, TaxNumber};

    fn store() -> (Arc<InMemoryCoordinationStore>, RetryStateStore<Arc<InMemoryCoordinationStore>>) {
        let raw = Arc::new(InMemoryCoordinationStore::new());
        let state = RetryStateStore::new(raw.clone(), Duration::from_secs(3600));
        (raw, state)
    }

    fn update(first: &str) -> BufferedEvent {
        let envelope = PersonEnvelope::update(PersonSnapshot::new(
            TaxNumber::parse("TAX001").unwrap(),
            first,
            "Doe",
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
        ));
        BufferedEvent::new(envelope, Headers::new().with("dlt-recovery-attempt", 1))
    }

    #[test]
    fn state_flag_round_trips() {
        let (_, state) = store();
        assert_eq!(state.state("TAX001").unwrap(), None);

        state.mark_retrying("TAX001").unwrap();
        assert_eq!(state.state("TAX001").unwrap(), Some(KeyState::Retrying));

        state.mark_dlt("TAX001").unwrap();
        assert_eq!(state.state("TAX001").unwrap(), Some(KeyState::Dlt));

        state.clear_state("TAX001").unwrap();
        assert_eq!(state.state("TAX001").unwrap(), None);
    }

    #[test]
    fn buffer_preserves_order() {
        let (_, state) = store();
        let (a, b, c) = (update("A"), update("B"), update("C"));

        state.buffer("TAX001", &[a.clone(), b.clone()]).unwrap();
        state.buffer("TAX001", std::slice::from_ref(&c)).unwrap();
        assert_eq!(state.buffered_len("TAX001").unwrap(), 3);

        for expected in [a, b, c] {
            assert_eq!(state.peek_buffered("TAX001").unwrap(), Some(expected));
            state.advance_buffer("TAX001").unwrap();
        }
        assert_eq!(state.peek_buffered("TAX001").unwrap(), None);
    }

    #[test]
    fn peeking_leaves_the_head_in_place() {
        let (_, state) = store();
        let (a, b) = (update("A"), update("B"));
        state.buffer("TAX001", &[a.clone(), b]).unwrap();

        assert_eq!(state.peek_buffered("TAX001").unwrap(), Some(a.clone()));
        assert_eq!(state.peek_buffered("TAX001").unwrap(), Some(a));
        assert_eq!(state.buffered_len("TAX001").unwrap(), 2);
    }

    #[test]
    fn clearing_the_buffer_drops_every_entry() {
        let (_, state) = store();
        state.buffer("TAX001", &[update("A"), update("B")]).unwrap();
        state.clear_buffer("TAX001").unwrap();
        assert_eq!(state.buffered_len("TAX001").unwrap(), 0);
        assert_eq!(state.peek_buffered("TAX001").unwrap(), None);
    }

    #[test]
    fn undecodable_buffer_entry_is_an_error_and_stays_queued() {
        let (raw, state) = store();
        let good = update("A");
        raw.push_back(
            "person:buffer:TAX001",
            &["{not json".to_string()],
            Duration::from_secs(60),
        )
        .unwrap();
        state.buffer("TAX001", std::slice::from_ref(&good)).unwrap();

        assert!(matches!(
            state.peek_buffered("TAX001"),
            Err(CoordinationError::Serialization(_))
        ));
        assert_eq!(state.buffered_len("TAX001").unwrap(), 2);
    }

    #[test]
    fn processed_markers_are_per_event() {
        let (_, state) = store();
        let env = update("A").envelope;
        assert!(!state.is_processed(env.event_id()).unwrap());
        state.mark_processed(env.event_id()).unwrap();
        assert!(state.is_processed(env.event_id()).unwrap());
        assert!(!state.is_processed(EventId::new()).unwrap());
    }
}
