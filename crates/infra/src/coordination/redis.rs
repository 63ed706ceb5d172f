//! Redis-backed coordination store.
//!
//! Commands map one-to-one onto the contract: `SET EX`, `GET`, `EXISTS`, `DEL`,
//! `RPUSH` + `EXPIRE` (in one `MULTI`), `LPOP`, `BLPOP`, `LLEN`. A connection
//! is taken per call so a blocked `BLPOP` never holds up other workers.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::{CoordinationError, CoordinationStore};

#[derive(Debug, Clone)]
pub struct RedisCoordinationStore {
    client: Arc<redis::Client>,
}

impl RedisCoordinationStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, CoordinationError> {
        self.client
            .get_connection()
            .map_err(|e| CoordinationError::Connection(e.to_string()))
    }
}

fn command_error(command: &str, err: redis::RedisError) -> CoordinationError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
        CoordinationError::Connection(format!("{command} failed: {err}"))
    } else {
        CoordinationError::Command(format!("{command} failed: {err}"))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl CoordinationStore for RedisCoordinationStore {
    #[instrument(skip(self, value), err)]
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query::<()>(&mut conn)
            .map_err(|e| command_error("SET", e))
    }

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("GET", e))
    }

    fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("EXISTS")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("EXISTS", e))
    }

    #[instrument(skip(self), err)]
    fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("DEL")
            .arg(key)
            .query::<()>(&mut conn)
            .map_err(|e| command_error("DEL", e))
    }

    #[instrument(skip(self, values), fields(count = values.len()), err)]
    fn push_back(&self, key: &str, values: &[String], ttl: Duration) -> Result<(), CoordinationError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(values)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query::<()>(&mut conn)
            .map_err(|e| command_error("RPUSH", e))
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("LPOP")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("LPOP", e))
    }

    fn peek_front(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("LINDEX")
            .arg(key)
            .arg(0)
            .query(&mut conn)
            .map_err(|e| command_error("LINDEX", e))
    }

    #[instrument(skip(self), err)]
    fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CoordinationError> {
        let mut conn = self.connection()?;
        // BLPOP 0 blocks forever; keep the wait bounded.
        let secs = timeout.as_secs_f64().max(0.001);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(secs)
            .query(&mut conn)
            .map_err(|e| command_error("BLPOP", e))?;
        Ok(popped.map(|(_, value)| value))
    }

    fn list_len(&self, key: &str) -> Result<usize, CoordinationError> {
        let mut conn = self.connection()?;
        redis::cmd("LLEN")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| command_error("LLEN", e))
    }
}
