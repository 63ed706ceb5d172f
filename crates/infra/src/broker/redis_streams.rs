//! Redis Streams-backed message broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per topic**: `taxflow:{topic}`
//! - **Entry fields**: `key`, `payload` (JSON), `headers` (JSON)
//! - **Consumer groups**: created on first poll with `MKSTREAM`
//! - **Receipt**: the stream entry id, acknowledged with `XACK` on commit
//!
//! A stream has a single partition, so per-key order is the append order.
//!
//! Rollback re-reads the consumer's pending (delivered, unacknowledged)
//! entries before any new one. The first poll of a topic does the same, so
//! entries left pending by a crashed run are picked up again.
//!
//! Entries whose payload cannot be decoded are forwarded raw to the
//! dead-letter stream with a `final-error` header and acknowledged.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, instrument, warn};

use taxflow_events::{headers, ConsumerRecord, Headers, MessageBroker, ProducerRecord};

const STREAM_PREFIX: &str = "taxflow:";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("broker state lock poisoned")]
    Poisoned,
}

/// Raw stream entry before decoding.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    key: Option<String>,
    payload: Option<String>,
    headers: Option<String>,
}

#[derive(Debug)]
pub struct RedisStreamsBroker<M> {
    client: Arc<redis::Client>,
    consumer: String,
    dead_letter_topic: String,
    /// (topic, group) pairs whose group exists.
    groups: Mutex<HashSet<(String, String)>>,
    /// (topic, group) pairs that must re-read pending entries first.
    rewind: Mutex<HashSet<(String, String)>>,
    _message: PhantomData<fn() -> M>,
}

impl<M> RedisStreamsBroker<M> {
    /// Create a broker for `redis_url`.
    ///
    /// * `consumer` - consumer name inside every group (unique per process)
    /// * `dead_letter_topic` - where undecodable entries are forwarded
    pub fn new(
        redis_url: impl AsRef<str>,
        consumer: impl Into<String>,
        dead_letter_topic: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            consumer: consumer.into(),
            dead_letter_topic: dead_letter_topic.into(),
            groups: Mutex::new(HashSet::new()),
            rewind: Mutex::new(HashSet::new()),
            _message: PhantomData,
        })
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// A new group starts at the beginning of the stream.
    pub fn ensure_consumer_group(&self, topic: &str, group: &str) -> Result<(), RedisStreamsError> {
        let id = (topic.to_string(), group.to_string());
        if self.groups.lock().map_err(|_| RedisStreamsError::Poisoned)?.contains(&id) {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key(topic))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }

        self.groups.lock().map_err(|_| RedisStreamsError::Poisoned)?.insert(id.clone());
        // Entries pending from an earlier run come first.
        self.rewind.lock().map_err(|_| RedisStreamsError::Poisoned)?.insert(id);
        Ok(())
    }

    fn xadd(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        key: &str,
        payload: &str,
        headers: &Headers,
    ) -> Result<String, RedisStreamsError> {
        let headers = serde_json::to_string(headers)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;

        redis::cmd("XADD")
            .arg(stream_key(topic))
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(payload)
            .arg("headers")
            .arg(&headers)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))
    }

    fn xack(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), RedisStreamsError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: u64 = redis::cmd("XACK")
            .arg(stream_key(topic))
            .arg(group)
            .arg(ids)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    fn read_group(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        group: &str,
        count: usize,
        block: Option<Duration>,
        from: &str,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(stream_key(topic)).arg(from);

        let reply: redis::Value = cmd
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;
        Ok(parse_read_reply(reply))
    }

    /// Forward an undecodable entry to the dead-letter stream.
    fn forward_undecodable(
        &self,
        conn: &mut redis::Connection,
        topic: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<(), RedisStreamsError> {
        if topic == self.dead_letter_topic {
            error!(topic = %topic, id = %entry.id, error = %reason, "dropping undecodable dead-letter entry");
            return Ok(());
        }

        let meta = Headers::new()
            .with(headers::FINAL_ERROR, reason)
            .with(headers::DLT_REASON, "deserialization-error")
            .with(headers::ORIGINAL_TOPIC, topic);
        self.xadd(
            conn,
            &self.dead_letter_topic,
            entry.key.as_deref().unwrap_or_default(),
            entry.payload.as_deref().unwrap_or_default(),
            &meta,
        )?;
        warn!(topic = %topic, id = %entry.id, error = %reason, "forwarded undecodable entry to dead-letter topic");
        Ok(())
    }

    fn needs_rewind(&self, topic: &str, group: &str) -> Result<bool, RedisStreamsError> {
        let rewind = self.rewind.lock().map_err(|_| RedisStreamsError::Poisoned)?;
        Ok(rewind.contains(&(topic.to_string(), group.to_string())))
    }

    fn clear_rewind(&self, topic: &str, group: &str) -> Result<(), RedisStreamsError> {
        self.rewind
            .lock()
            .map_err(|_| RedisStreamsError::Poisoned)?
            .remove(&(topic.to_string(), group.to_string()));
        Ok(())
    }
}

impl<M> MessageBroker<M> for RedisStreamsBroker<M>
where
    M: Serialize + DeserializeOwned,
{
    type Error = RedisStreamsError;

    #[instrument(skip(self, record), fields(topic = %record.topic, key = %record.key), err)]
    fn send(&self, record: ProducerRecord<M>) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&record.value)
            .map_err(|e| RedisStreamsError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;
        self.xadd(&mut conn, &record.topic, &record.key, &payload, &record.headers)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn poll(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumerRecord<M>>, Self::Error> {
        self.ensure_consumer_group(topic, group)?;
        let mut conn = self.connection()?;

        let mut entries = Vec::new();
        if self.needs_rewind(topic, group)? {
            entries = self.read_group(&mut conn, topic, group, max_records, None, "0")?;
            if entries.is_empty() {
                self.clear_rewind(topic, group)?;
            }
        }
        if entries.is_empty() {
            entries = self.read_group(&mut conn, topic, group, max_records, Some(timeout), ">")?;
        }

        let mut records = Vec::with_capacity(entries.len());
        let mut discard = Vec::new();

        for entry in entries {
            let decoded = match (&entry.key, &entry.payload) {
                (Some(key), Some(payload)) => serde_json::from_str::<M>(payload)
                    .map(|value| (key.clone(), value))
                    .map_err(|e| format!("failed to decode payload: {e}")),
                // Pending entry trimmed from the stream.
                (None, None) => {
                    discard.push(entry.id);
                    continue;
                }
                _ => Err("entry is missing key or payload".to_string()),
            };

            let (key, value) = match decoded {
                Ok(ok) => ok,
                Err(reason) => {
                    self.forward_undecodable(&mut conn, topic, &entry, &reason)?;
                    discard.push(entry.id);
                    continue;
                }
            };

            let headers = entry
                .headers
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Headers>(raw).ok())
                .unwrap_or_default();
            let (millis, sequence) = split_entry_id(&entry.id);

            records.push(ConsumerRecord {
                topic: topic.to_string(),
                partition: 0,
                offset: sequence,
                key,
                value,
                headers,
                timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
                receipt: entry.id,
            });
        }

        self.xack(&mut conn, topic, group, &discard)?;
        Ok(records)
    }

    #[instrument(skip(self, records), fields(records = records.len()), err)]
    fn commit(&self, group: &str, records: &[ConsumerRecord<M>]) -> Result<(), Self::Error> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;

        let mut topics: Vec<&str> = records.iter().map(|r| r.topic.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();

        for topic in topics {
            let ids: Vec<String> = records
                .iter()
                .filter(|r| r.topic == topic)
                .map(|r| r.receipt.clone())
                .collect();
            self.xack(&mut conn, topic, group, &ids)?;
        }
        Ok(())
    }

    fn rollback(&self, topic: &str, group: &str) -> Result<(), Self::Error> {
        self.rewind
            .lock()
            .map_err(|_| RedisStreamsError::Poisoned)?
            .insert((topic.to_string(), group.to_string()));
        Ok(())
    }
}

fn stream_key(topic: &str) -> String {
    format!("{STREAM_PREFIX}{topic}")
}

/// `1700000000000-3` → `(1700000000000, 3)`.
fn split_entry_id(id: &str) -> (i64, u64) {
    let (millis, seq) = id.split_once('-').unwrap_or((id, "0"));
    (millis.parse().unwrap_or(0), seq.parse().unwrap_or(0))
}

fn value_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse an `XREADGROUP` reply: `[[stream, [[id, [field, value, ...]], ...]]]`.
///
/// A nil reply (block timeout) is an empty read.
fn parse_read_reply(reply: redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(streams) = reply else {
        return vec![];
    };

    let mut out = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(parts) = stream else {
            continue;
        };
        let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else {
            continue;
        };

        for entry in entries {
            let redis::Value::Bulk(fields) = entry else {
                continue;
            };
            if fields.is_empty() {
                continue;
            }
            let Some(id) = value_string(&fields[0]) else {
                continue;
            };
            let mut parsed = StreamEntry {
                id,
                key: None,
                payload: None,
                headers: None,
            };

            if let Some(redis::Value::Bulk(pairs)) = fields.into_iter().nth(1) {
                for chunk in pairs.chunks(2) {
                    let [name, value] = chunk else {
                        continue;
                    };
                    match value_string(name).as_deref() {
                        Some("key") => parsed.key = value_string(value),
                        Some("payload") => parsed.payload = value_string(value),
                        Some("headers") => parsed.headers = value_string(value),
                        _ => {}
                    }
                }
            }
            out.push(parsed);
        }
    }
    out
}
