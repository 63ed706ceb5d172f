//! Partitioned log broker abstraction (mechanics only).
//!
//! This module provides the contract the pipeline needs from a message broker:
//! an append-only, partitioned, key-ordered log with consumer groups and manual
//! offset commits.
//!
//! ## Delivery Guarantees
//!
//! - **Key ordering**: records sharing a key land in the same partition and are
//!   delivered in publish order.
//! - **At-least-once**: a record is redelivered until its group commits it. A
//!   consumer that crashes (or calls [`MessageBroker::rollback`]) before
//!   committing sees the uncommitted records again.
//! - **Consumer groups**: each group tracks its own committed position, so the
//!   batch consumer, every retry stage and the recovery loop progress
//!   independently over their topics.
//!
//! Consumers must be idempotent: the same record may be handled twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::headers::Headers;

/// A record to append to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord<M> {
    pub topic: String,
    pub key: String,
    pub value: M,
    pub headers: Headers,
}

impl<M> ProducerRecord<M> {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: M) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            value,
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A record delivered to a consumer group.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord<M> {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: M,
    pub headers: Headers,
    /// When the broker accepted the record.
    pub timestamp: DateTime<Utc>,
    /// Broker-specific acknowledgment handle (e.g. a stream entry id).
    pub receipt: String,
}

/// Domain-agnostic message broker (partitioned log with consumer groups).
///
/// ## Architecture Role
///
/// ```text
/// producer → main topic → batch consumer ─┬→ store
///                                         └→ retry-1..N → retry workers → dead-letter
///                                                                              ↓
///                                             main topic ← recovery loop ←────┘
/// ```
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; workers for different topics share one
/// broker instance.
pub trait MessageBroker<M>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a record to its topic.
    fn send(&self, record: ProducerRecord<M>) -> Result<(), Self::Error>;

    /// Fetch up to `max_records` records past the group's delivered position,
    /// waiting at most `timeout` for the first one.
    fn poll(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord<M>>, Self::Error>;

    /// Commit the given records for `group` (each record's partition moves past
    /// its offset).
    fn commit(&self, group: &str, records: &[ConsumerRecord<M>]) -> Result<(), Self::Error>;

    /// Rewind the group's delivered position to its committed position so the
    /// uncommitted records are delivered again.
    fn rollback(&self, topic: &str, group: &str) -> Result<(), Self::Error>;
}

impl<M, B> MessageBroker<M> for Arc<B>
where
    B: MessageBroker<M> + ?Sized,
{
    type Error = B::Error;

    fn send(&self, record: ProducerRecord<M>) -> Result<(), Self::Error> {
        (**self).send(record)
    }

    fn poll(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord<M>>, Self::Error> {
        (**self).poll(topic, group, max_records, timeout)
    }

    fn commit(&self, group: &str, records: &[ConsumerRecord<M>]) -> Result<(), Self::Error> {
        (**self).commit(group, records)
    }

    fn rollback(&self, topic: &str, group: &str) -> Result<(), Self::Error> {
        (**self).rollback(topic, group)
    }
}
