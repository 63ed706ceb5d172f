//! Shared fixtures for pipeline tests.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use taxflow_core::{DebtAmount, Person, PersonSnapshot, TaxNumber};
use taxflow_events::{
    ConsumerRecord, Headers, InMemoryBroker, MessageBroker, PersonEnvelope, ProducerRecord,
};

use crate::batch_engine::KeyedBatchEngine;
use crate::config::MessagingConfig;
use crate::coordination::{InMemoryCoordinationStore, RetryLatch, RetryStateStore};
use crate::persistence::{InMemoryPersonStore, PersonStore};
use crate::retry::BackoffPolicy;

pub type TestBroker = Arc<InMemoryBroker<PersonEnvelope>>;
pub type TestStore = Arc<InMemoryPersonStore>;
pub type TestCoordination = Arc<InMemoryCoordinationStore>;

/// Fast settings: no backoff, short latch wait.
pub fn test_config() -> MessagingConfig {
    MessagingConfig::default()
        .with_backoff(BackoffPolicy::immediate())
        .with_wait_timeout(Duration::from_secs(2))
}

pub struct Fixture {
    pub broker: TestBroker,
    pub store: TestStore,
    pub coordination: TestCoordination,
    pub config: MessagingConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MessagingConfig) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::new()),
            store: Arc::new(InMemoryPersonStore::new()),
            coordination: Arc::new(InMemoryCoordinationStore::new()),
            config,
        }
    }

    pub fn engine(&self) -> KeyedBatchEngine<TestBroker, TestStore, TestCoordination> {
        KeyedBatchEngine::new(
            self.broker.clone(),
            self.store.clone(),
            self.coordination.clone(),
            &self.config,
        )
    }

    pub fn state(&self) -> RetryStateStore<TestCoordination> {
        RetryStateStore::new(self.coordination.clone(), self.config.retry.state_ttl)
    }

    pub fn latch(&self) -> RetryLatch<TestCoordination> {
        RetryLatch::new(self.coordination.clone(), self.config.retry.state_ttl)
    }

    /// Create a person directly in the store.
    pub fn seed(&self, tax: &str) {
        self.store
            .create_from_event(&snapshot(tax, "Jane"))
            .expect("seed person");
    }

    pub fn person(&self, tax: &str) -> Option<Person> {
        self.store
            .find_by_tax_number(&TaxNumber::parse(tax).expect("tax number"))
            .expect("find person")
    }

    pub fn publish(&self, topic: &str, envelope: PersonEnvelope, headers: Headers) {
        let key = envelope.key().to_string();
        self.broker
            .send(ProducerRecord::new(topic, key, envelope).with_headers(headers))
            .expect("publish");
    }

    pub fn main(&self) -> Vec<ConsumerRecord<PersonEnvelope>> {
        self.broker.published(&self.config.main_topic)
    }

    pub fn stage(&self, stage: u32) -> Vec<ConsumerRecord<PersonEnvelope>> {
        self.broker.published(&self.config.retry_topic(stage))
    }

    pub fn dlt(&self) -> Vec<ConsumerRecord<PersonEnvelope>> {
        self.broker.published(&self.config.dlt_topic())
    }
}

pub fn snapshot(tax: &str, first: &str) -> PersonSnapshot {
    PersonSnapshot::new(
        TaxNumber::parse(tax).expect("tax number"),
        first,
        "Doe",
        NaiveDate::from_ymd_opt(1980, 3, 14).expect("date"),
    )
}

pub fn create(tax: &str) -> PersonEnvelope {
    PersonEnvelope::create(snapshot(tax, "Jane"))
}

pub fn update(tax: &str, first: &str) -> PersonEnvelope {
    PersonEnvelope::update(snapshot(tax, first))
}

pub fn delete(tax: &str) -> PersonEnvelope {
    PersonEnvelope::delete(snapshot(tax, "Jane"))
}

pub fn debt(tax: &str, cents: u64) -> PersonEnvelope {
    PersonEnvelope::add_debt(
        TaxNumber::parse(tax).expect("tax number"),
        DebtAmount::from_cents(cents).expect("amount"),
    )
}

/// Wrap envelopes as consumed main-topic records (offsets in slice order).
pub fn records(envelopes: &[PersonEnvelope]) -> Vec<ConsumerRecord<PersonEnvelope>> {
    envelopes
        .iter()
        .enumerate()
        .map(|(i, env)| record_with(env.clone(), Headers::new(), i as u64))
        .collect()
}

pub fn record_with(
    envelope: PersonEnvelope,
    headers: Headers,
    offset: u64,
) -> ConsumerRecord<PersonEnvelope> {
    ConsumerRecord {
        topic: "person.events".to_string(),
        partition: 0,
        offset,
        key: envelope.key().to_string(),
        value: envelope,
        headers,
        timestamp: Utc::now(),
        receipt: format!("0:{offset}"),
    }
}

pub fn no_ack() -> Result<(), Infallible> {
    Ok(())
}

#[derive(Debug, thiserror::Error)]
#[error("broker unavailable")]
pub struct BrokerDown;

/// Broker whose every operation fails.
#[derive(Debug, Clone, Copy)]
pub struct FailingBroker;

impl MessageBroker<PersonEnvelope> for FailingBroker {
    type Error = BrokerDown;

    fn send(&self, _record: ProducerRecord<PersonEnvelope>) -> Result<(), Self::Error> {
        Err(BrokerDown)
    }

    fn poll(
        &self,
        _topic: &str,
        _group: &str,
        _max_records: usize,
        _timeout: Duration,
    ) -> Result<Vec<ConsumerRecord<PersonEnvelope>>, Self::Error> {
        Err(BrokerDown)
    }

    fn commit(
        &self,
        _group: &str,
        _records: &[ConsumerRecord<PersonEnvelope>],
    ) -> Result<(), Self::Error> {
        Err(BrokerDown)
    }

    fn rollback(&self, _topic: &str, _group: &str) -> Result<(), Self::Error> {
        Err(BrokerDown)
    }
}
