//! In-memory partitioned log broker for tests/dev.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::broker::{ConsumerRecord, MessageBroker, ProducerRecord};
use crate::headers::Headers;

const DEFAULT_PARTITIONS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBrokerError {
    /// Internal lock poisoning.
    #[error("in-memory broker lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
struct StoredRecord<M> {
    /// Global publish order across all topics (test introspection).
    seq: u64,
    key: String,
    value: M,
    headers: Headers,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct GroupCursor {
    committed: Vec<u64>,
    delivered: Vec<u64>,
}

#[derive(Debug)]
struct State<M> {
    next_seq: u64,
    topics: HashMap<String, Vec<Vec<StoredRecord<M>>>>,
    /// Keyed by (group, topic).
    cursors: HashMap<(String, String), GroupCursor>,
}

/// In-memory broker.
///
/// - Fixed partition count per topic, key-hash partitioning
/// - Per-group committed and delivered positions (at-least-once via rollback)
/// - `poll` blocks on a condition variable until records arrive or the timeout expires
#[derive(Debug)]
pub struct InMemoryBroker<M> {
    partitions: u32,
    state: Mutex<State<M>>,
    arrived: Condvar,
}

impl<M> InMemoryBroker<M> {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Mutex::new(State {
                next_seq: 0,
                topics: HashMap::new(),
                cursors: HashMap::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<M>>, InMemoryBrokerError> {
        self.state.lock().map_err(|_| InMemoryBrokerError::Poisoned)
    }
}

impl<M: Clone> InMemoryBroker<M> {
    /// Every record ever published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<ConsumerRecord<M>> {
        let Ok(state) = self.state.lock() else {
            return vec![];
        };
        let Some(partitions) = state.topics.get(topic) else {
            return vec![];
        };

        let mut out: Vec<(u64, ConsumerRecord<M>)> = partitions
            .iter()
            .enumerate()
            .flat_map(|(p, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, r)| (r.seq, to_consumer_record(topic, p as u32, offset as u64, r)))
            })
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, r)| r).collect()
    }

    /// Number of records in `topic` not yet committed by `group`.
    pub fn lag(&self, topic: &str, group: &str) -> usize {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        let Some(partitions) = state.topics.get(topic) else {
            return 0;
        };
        let committed = state
            .cursors
            .get(&(group.to_string(), topic.to_string()))
            .map(|c| c.committed.clone())
            .unwrap_or_else(|| vec![0; partitions.len()]);

        partitions
            .iter()
            .zip(committed)
            .map(|(records, c)| records.len().saturating_sub(c as usize))
            .sum()
    }
}

impl<M> Default for InMemoryBroker<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn to_consumer_record<M: Clone>(
    topic: &str,
    partition: u32,
    offset: u64,
    record: &StoredRecord<M>,
) -> ConsumerRecord<M> {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: record.key.clone(),
        value: record.value.clone(),
        headers: record.headers.clone(),
        timestamp: record.timestamp,
        receipt: format!("{partition}:{offset}"),
    }
}

fn ensure_topic<'a, M>(
    state: &'a mut State<M>,
    topic: &str,
    partitions: u32,
) -> &'a mut Vec<Vec<StoredRecord<M>>> {
    state
        .topics
        .entry(topic.to_string())
        .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect())
}

impl<M> MessageBroker<M> for InMemoryBroker<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBrokerError;

    fn send(&self, record: ProducerRecord<M>) -> Result<(), Self::Error> {
        let partition = self.partition_for(&record.key) as usize;
        let mut state = self.lock()?;

        let seq = state.next_seq;
        state.next_seq += 1;

        ensure_topic(&mut state, &record.topic, self.partitions)[partition].push(StoredRecord {
            seq,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: Utc::now(),
        });

        drop(state);
        self.arrived.notify_all();
        Ok(())
    }

    fn poll(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord<M>>, Self::Error> {
        let deadline = Instant::now() + timeout;
        let cursor_key = (group.to_string(), topic.to_string());
        let mut state = self.lock()?;

        loop {
            ensure_topic(&mut state, topic, self.partitions);
            let partitions = self.partitions as usize;
            let cursor = state
                .cursors
                .entry(cursor_key.clone())
                .or_insert_with(|| GroupCursor {
                    committed: vec![0; partitions],
                    delivered: vec![0; partitions],
                })
                .clone();

            let mut out = Vec::new();
            let mut delivered = cursor.delivered.clone();
            if let Some(topic_partitions) = state.topics.get(topic) {
                for (p, records) in topic_partitions.iter().enumerate() {
                    let start = delivered[p] as usize;
                    for (offset, record) in records.iter().enumerate().skip(start) {
                        if out.len() >= max_records {
                            break;
                        }
                        out.push(to_consumer_record(topic, p as u32, offset as u64, record));
                        delivered[p] = offset as u64 + 1;
                    }
                }
            }

            if !out.is_empty() {
                if let Some(c) = state.cursors.get_mut(&cursor_key) {
                    c.delivered = delivered;
                }
                return Ok(out);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(out);
            }

            let (guard, _) = self
                .arrived
                .wait_timeout(state, deadline - now)
                .map_err(|_| InMemoryBrokerError::Poisoned)?;
            state = guard;
        }
    }

    fn commit(&self, group: &str, records: &[ConsumerRecord<M>]) -> Result<(), Self::Error> {
        let mut state = self.lock()?;
        let partitions = self.partitions as usize;

        for record in records {
            let cursor = state
                .cursors
                .entry((group.to_string(), record.topic.clone()))
                .or_insert_with(|| GroupCursor {
                    committed: vec![0; partitions],
                    delivered: vec![0; partitions],
                });
            let p = record.partition as usize;
            cursor.committed[p] = cursor.committed[p].max(record.offset + 1);
            cursor.delivered[p] = cursor.delivered[p].max(cursor.committed[p]);
        }

        Ok(())
    }

    fn rollback(&self, topic: &str, group: &str) -> Result<(), Self::Error> {
        let mut state = self.lock()?;
        if let Some(cursor) = state.cursors.get_mut(&(group.to_string(), topic.to_string())) {
            cursor.delivered = cursor.committed.clone();
        }
        drop(state);
        self.arrived.notify_all();
        Ok(())
    }
}
