//! Blocking rendezvous between a batch worker and a retry worker.
//!
//! The retry worker resolving a key pushes one terminal outcome onto the key's
//! signal list; a batch worker waiting behind that retry pops it with a bounded
//! blocking pop. The two sides may live in different processes: the store is
//! the only synchronization point.

use std::time::Duration;

use tracing::warn;

use super::{CoordinationError, CoordinationStore};

const SIGNAL_PREFIX: &str = "retry:signal:";

/// Outcome delivered through the latch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryStatus {
    /// The retried event (and its buffered dependents) were applied.
    Success,
    /// The retried event was dead-lettered.
    Dlt,
    /// No outcome arrived in time. Produced locally, never stored.
    Timeout,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Success => "SUCCESS",
            RetryStatus::Dlt => "DLT",
            RetryStatus::Timeout => "TIMEOUT",
        }
    }
}

impl core::fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RetryLatch<C> {
    store: C,
    ttl: Duration,
}

impl<C: CoordinationStore> RetryLatch<C> {
    pub fn new(store: C, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Drop any outcome left over from an earlier, already-resolved cycle.
    pub fn clear_stale_signal(&self, key: &str) -> Result<(), CoordinationError> {
        self.store.delete(&signal_key(key))
    }

    /// Block until the key's retry resolves or `timeout` expires.
    pub fn wait_for_result(&self, key: &str, timeout: Duration) -> Result<RetryStatus, CoordinationError> {
        let Some(raw) = self.store.blocking_pop_front(&signal_key(key), timeout)? else {
            return Ok(RetryStatus::Timeout);
        };

        Ok(match raw.as_str() {
            "SUCCESS" => RetryStatus::Success,
            "DLT" => RetryStatus::Dlt,
            other => {
                warn!(key = %key, signal = %other, "unrecognised retry signal; treating as timeout");
                RetryStatus::Timeout
            }
        })
    }

    /// Publish a terminal outcome for the key.
    pub fn notify_result(&self, key: &str, status: RetryStatus) -> Result<(), CoordinationError> {
        if status == RetryStatus::Timeout {
            return Ok(());
        }
        self.store
            .push_back(&signal_key(key), &[status.as_str().to_string()], self.ttl)
    }
}

fn signal_key(key: &str) -> String {
    format!("{SIGNAL_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use std::sync::Arc;
    use std::thread;

    fn latch() -> RetryLatch<Arc<InMemoryCoordinationStore>> {
        RetryLatch::new(Arc::new(InMemoryCoordinationStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn waiter_receives_the_notified_outcome() {
        let latch = latch();
        let notifier = latch.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            notifier.notify_result("TAX001", RetryStatus::Dlt).unwrap();
        });

        let status = latch
            .wait_for_result("TAX001", Duration::from_secs(5))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(status, RetryStatus::Dlt);
    }

    #[test]
    fn wait_expires_as_timeout() {
        let status = latch()
            .wait_for_result("TAX001", Duration::from_millis(20))
            .unwrap();
        assert_eq!(status, RetryStatus::Timeout);
    }

    #[test]
    fn stale_signal_is_not_consumed_after_clearing() {
        let latch = latch();
        latch.notify_result("TAX001", RetryStatus::Success).unwrap();
        latch.clear_stale_signal("TAX001").unwrap();

        let status = latch
            .wait_for_result("TAX001", Duration::from_millis(20))
            .unwrap();
        assert_eq!(status, RetryStatus::Timeout);
    }

    #[test]
    fn each_signal_is_consumed_once() {
        let latch = latch();
        latch.notify_result("TAX001", RetryStatus::Success).unwrap();

        assert_eq!(
            latch.wait_for_result("TAX001", Duration::from_millis(20)).unwrap(),
            RetryStatus::Success
        );
        assert_eq!(
            latch.wait_for_result("TAX001", Duration::from_millis(20)).unwrap(),
            RetryStatus::Timeout
        );
    }
}
