//! Message headers (retry and recovery metadata).
//!
//! Headers travel next to the envelope, never inside it: the payload stays
//! immutable while the retry chain rewrites its metadata at every hop.

use serde::{Deserialize, Serialize};

/// Stage hop counter, `1..=max_retries`, `max_retries + 1` on an exhausted dead letter.
pub const RETRY_COUNT: &str = "retry-count";
/// Last processing error seen for a retried record.
pub const ERROR_MESSAGE: &str = "error-message";
/// Error that sent a record to the dead-letter topic.
pub const FINAL_ERROR: &str = "final-error";
/// Why a record was dead-lettered (`fatal-error`, `max-retries-exceeded`, ...).
pub const DLT_REASON: &str = "dlt-reason";
/// Backoff computed for the stage, in milliseconds.
pub const RETRY_DELAY_MS: &str = "retry-delay-ms";
/// Epoch millis before which a retry worker must not attempt the record.
pub const RETRY_NOT_BEFORE: &str = "retry-not-before";
/// Topic the record was first consumed from.
pub const ORIGINAL_TOPIC: &str = "original-topic";
/// How many times the recovery loop re-injected the record.
pub const RECOVERY_ATTEMPT: &str = "dlt-recovery-attempt";
/// When the recovery loop last re-injected the record (RFC 3339).
pub const RECOVERY_TIMESTAMP: &str = "dlt-recovery-timestamp";

/// Ordered string multimap. Lookups return the last value for a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping earlier values with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) {
        let name = name.into();
        self.0.retain(|(n, _)| *n != name);
        self.0.push((name, value.to_string()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| n != name);
    }

    pub fn last(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the last value of `name` as an integer.
    ///
    /// `None` if absent, `Some(Err(raw))` if present but not a number.
    pub fn last_u32(&self, name: &str) -> Option<Result<u32, String>> {
        self.last(name)
            .map(|raw| raw.trim().parse::<u32>().map_err(|_| raw.to_string()))
    }

    pub fn last_i64(&self, name: &str) -> Option<i64> {
        self.last(name).and_then(|raw| raw.trim().parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_value_wins() {
        let mut headers = Headers::new();
        headers.add(RETRY_COUNT, "1");
        headers.add(RETRY_COUNT, "2");
        assert_eq!(headers.last(RETRY_COUNT), Some("2"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers = Headers::new().with(RETRY_COUNT, 1);
        headers.add(RETRY_COUNT, "7");
        headers.set(RETRY_COUNT, 3);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.last_u32(RETRY_COUNT), Some(Ok(3)));
    }

    #[test]
    fn unparsable_counter_is_reported() {
        let headers = Headers::new().with(RECOVERY_ATTEMPT, "abc");
        assert_eq!(headers.last_u32(RECOVERY_ATTEMPT), Some(Err("abc".to_string())));
        assert_eq!(headers.last_u32(RETRY_COUNT), None);
    }
}
