//! Cross-worker coordination over a shared key-value store.
//!
//! Batch workers and retry workers never share memory. Everything they need to
//! agree on (a key's retry state, its buffered dependents, the outcome of an
//! in-flight retry) lives in a [`CoordinationStore`], and every access is one
//! atomic store command.

pub mod in_memory;
pub mod latch;
#[cfg(feature = "redis")]
pub mod redis;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use in_memory::InMemoryCoordinationStore;
pub use latch::{RetryLatch, RetryStatus};
#[cfg(feature = "redis")]
pub use redis::RedisCoordinationStore;
pub use state::{BufferedEvent, KeyState, RetryStateStore};

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination store connection error: {0}")]
    Connection(String),

    #[error("coordination store command error: {0}")]
    Command(String),

    #[error("coordination value serialization error: {0}")]
    Serialization(String),

    #[error("coordination store lock poisoned")]
    Poisoned,
}

/// Minimal key-value + FIFO list contract (a subset of Redis semantics).
///
/// ## Semantics
///
/// - String values and lists share one key space; `delete` removes either.
/// - `push_back` appends in order and (re)arms the key's TTL.
/// - `peek_front` followed by `pop_front` lets a single consumer settle the
///   head before removing it.
/// - `blocking_pop_front` waits up to `timeout` for an element; `None` means
///   the wait expired. It is the rendezvous primitive between workers.
pub trait CoordinationStore: Send + Sync {
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordinationError>;

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    fn exists(&self, key: &str) -> Result<bool, CoordinationError>;

    fn delete(&self, key: &str) -> Result<(), CoordinationError>;

    fn push_back(&self, key: &str, values: &[String], ttl: Duration) -> Result<(), CoordinationError>;

    fn pop_front(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// Read the head of a list without removing it.
    fn peek_front(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoordinationError>;

    fn list_len(&self, key: &str) -> Result<usize, CoordinationError>;
}

impl<S> CoordinationStore for Arc<S>
where
    S: CoordinationStore + ?Sized,
{
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordinationError> {
        (**self).set_with_ttl(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        (**self).get(key)
    }

    fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        (**self).exists(key)
    }

    fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        (**self).delete(key)
    }

    fn push_back(&self, key: &str, values: &[String], ttl: Duration) -> Result<(), CoordinationError> {
        (**self).push_back(key, values, ttl)
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        (**self).pop_front(key)
    }

    fn peek_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        (**self).peek_front(key)
    }

    fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoordinationError> {
        (**self).blocking_pop_front(key, timeout)
    }

    fn list_len(&self, key: &str) -> Result<usize, CoordinationError> {
        (**self).list_len(key)
    }
}
