use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{CoordinationError, CoordinationStore};

#[derive(Debug)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-memory coordination store.
///
/// Intended for tests/dev and single-process runs. TTLs are enforced lazily on
/// access; blocking pops wait on a condition variable that every push signals.
/// `set_offline(true)` makes every command fail with a connection error.
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Condvar,
    offline: AtomicBool,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CoordinationError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoordinationError::Connection("store offline".to_string()));
        }
        let mut entries = self.entries.lock().map_err(|_| CoordinationError::Poisoned)?;
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        Ok(entries)
    }
}

fn pop_list(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
    let entry = entries.get_mut(key)?;
    let Value::List(list) = &mut entry.value else {
        return None;
    };
    let head = list.pop_front();
    if list.is_empty() {
        entries.remove(key);
    }
    head
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordinationError> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let entries = self.lock()?;
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Text(v)) => Ok(Some(v.clone())),
            Some(Value::List(_)) => Err(CoordinationError::Command(format!(
                "WRONGTYPE key {key} holds a list"
            ))),
            None => Ok(None),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.lock()?.contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn push_back(&self, key: &str, values: &[String], ttl: Duration) -> Result<(), CoordinationError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut entries = self.lock()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        let Value::List(list) = &mut entry.value else {
            return Err(CoordinationError::Command(format!(
                "WRONGTYPE key {key} holds a string"
            )));
        };
        list.extend(values.iter().cloned());
        entry.expires_at = Some(Instant::now() + ttl);

        drop(entries);
        self.pushed.notify_all();
        Ok(())
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut entries = self.lock()?;
        Ok(pop_list(&mut entries, key))
    }

    fn peek_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let entries = self.lock()?;
        Ok(match entries.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.front().cloned(),
            _ => None,
        })
    }

    fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoordinationError> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock()?;

        loop {
            if let Some(head) = pop_list(&mut entries, key) {
                return Ok(Some(head));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .pushed
                .wait_timeout(entries, deadline - now)
                .map_err(|_| CoordinationError::Poisoned)?;
            entries = guard;

            if self.offline.load(Ordering::SeqCst) {
                return Err(CoordinationError::Connection("store offline".to_string()));
            }
        }
    }

    fn list_len(&self, key: &str) -> Result<usize, CoordinationError> {
        let entries = self.lock()?;
        Ok(match entries.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.len(),
            _ => 0,
        })
    }
}
