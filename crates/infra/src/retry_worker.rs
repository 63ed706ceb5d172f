//! Consumer for one retry stage (`{main}.retry-{n}`).
//!
//! A retry record is the head of its key: every later event of that key is
//! parked in the coordination buffer, and batch workers may be blocked on the
//! key's latch. The worker therefore owns the key's resolution:
//!
//! - **success**: drain the buffer in order, clear the flag, signal `SUCCESS`
//! - **retryable failure**: hand the record to the next stage (key stays flagged)
//! - **fatal failure or exhausted chain**: dead-letter the record and every
//!   buffered dependent, reset the key, signal `DLT`

use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use taxflow_events::{headers, ConsumerRecord, Headers, MessageBroker, PersonEnvelope};

use crate::applier::{ApplyError, EventApplier};
use crate::config::MessagingConfig;
use crate::coordination::{
    BufferedEvent, CoordinationError, CoordinationStore, RetryLatch, RetryStateStore, RetryStatus,
};
use crate::persistence::PersonStore;
use crate::retry::{classify, ErrorKind, RetryRouter, RouteOutcome, RouterError};

#[derive(Debug, thiserror::Error)]
pub enum RetryWorkerError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("retry batch acknowledgment failed: {0}")]
    Ack(String),
}

/// What happened to one retry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Applied; the key was released after draining `drained` buffered events.
    Resolved { drained: usize },
    /// Applied, but a buffered event failed retryably and now heads the key.
    Parked { drained: usize },
    /// Applied, but a buffered creation failed for good; the key is dead-lettered.
    DependencyFailed { drained: usize },
    /// Failed again and moved to the next stage.
    Escalated { stage: u32 },
    /// Dead-lettered together with `dependents` buffered events.
    DeadLettered { dependents: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub records: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub dead_lettered: usize,
    /// Buffered events applied while draining.
    pub drained: usize,
}

impl RetryReport {
    fn record(&mut self, outcome: &RetryOutcome) {
        self.records += 1;
        match outcome {
            RetryOutcome::Resolved { drained }
            | RetryOutcome::Parked { drained }
            | RetryOutcome::DependencyFailed { drained } => {
                self.resolved += 1;
                self.drained += drained;
            }
            RetryOutcome::Escalated { .. } => self.escalated += 1,
            RetryOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

enum Drain {
    Complete(usize),
    Parked(usize),
    CreationFailed(usize),
}

pub struct RetryWorker<B, S, C> {
    stage: u32,
    topic: String,
    group: String,
    applier: EventApplier<S, C>,
    router: RetryRouter<B>,
    state: RetryStateStore<C>,
    latch: RetryLatch<C>,
    max_delay: Duration,
}

impl<B, S, C> RetryWorker<B, S, C>
where
    B: MessageBroker<PersonEnvelope>,
    S: PersonStore,
    C: CoordinationStore + Clone,
{
    pub fn new(broker: B, store: S, coordination: C, config: &MessagingConfig, stage: u32) -> Self {
        let ttl = config.retry.state_ttl;
        let state = RetryStateStore::new(coordination.clone(), ttl);
        Self {
            stage,
            topic: config.retry_topic(stage),
            group: config.retry_group(stage),
            applier: EventApplier::new(store, state.clone()),
            router: RetryRouter::new(broker, config),
            state,
            latch: RetryLatch::new(coordination, ttl),
            max_delay: config.retry.backoff.max_delay,
        }
    }

    pub fn stage(&self) -> u32 {
        self.stage
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Handle a polled batch in order, then acknowledge it.
    pub fn process<A, E>(
        &self,
        records: &[ConsumerRecord<PersonEnvelope>],
        ack: A,
    ) -> Result<RetryReport, RetryWorkerError>
    where
        A: FnOnce() -> Result<(), E>,
        E: core::fmt::Display,
    {
        let mut report = RetryReport::default();
        for record in records {
            let outcome = self.handle_record(record)?;
            report.record(&outcome);
        }

        ack().map_err(|e| RetryWorkerError::Ack(e.to_string()))?;
        Ok(report)
    }

    #[instrument(skip_all, fields(stage = self.stage, key = %record.value.key()))]
    pub fn handle_record(
        &self,
        record: &ConsumerRecord<PersonEnvelope>,
    ) -> Result<RetryOutcome, RetryWorkerError> {
        let envelope = &record.value;
        let key = envelope.key();
        let attempt = retry_count(&record.headers);

        self.wait_until_due(&record.headers);

        let err = match self.applier.apply(envelope) {
            Ok(outcome) => {
                debug!(event_id = %envelope.event_id(), attempt, ?outcome, "retry applied");
                return self.release(key);
            }
            Err(ApplyError::Coordination(e)) => return Err(e.into()),
            Err(ApplyError::Processing(err)) => err,
        };

        match classify(&err) {
            ErrorKind::Fatal => {
                self.router
                    .send_to_dlt(envelope, key, "fatal-error", &err.to_string(), &record.headers)?;
                let dependents = self.abandon_key(key, envelope.is_creation())?;
                Ok(RetryOutcome::DeadLettered { dependents })
            }
            ErrorKind::Retryable => {
                match self.router.route_to_next_stage(
                    envelope,
                    key,
                    attempt,
                    &err.to_string(),
                    &record.headers,
                )? {
                    RouteOutcome::Retried { stage, .. } => Ok(RetryOutcome::Escalated { stage }),
                    RouteOutcome::DeadLettered { .. } => {
                        let dependents = self.abandon_key(key, envelope.is_creation())?;
                        Ok(RetryOutcome::DeadLettered { dependents })
                    }
                }
            }
        }
    }

    /// Drain the key and, if nothing new heads it, release its waiters.
    fn release(&self, key: &str) -> Result<RetryOutcome, RetryWorkerError> {
        match self.drain_buffer(key)? {
            Drain::Complete(drained) => {
                // Buffer first, flag second: a batch worker seeing the flag
                // cleared must find every dependent already applied.
                self.state.clear_state(key)?;
                self.latch.notify_result(key, RetryStatus::Success)?;
                info!(key = %key, drained, "retry resolved; key released");
                Ok(RetryOutcome::Resolved { drained })
            }
            Drain::Parked(drained) => Ok(RetryOutcome::Parked { drained }),
            Drain::CreationFailed(drained) => Ok(RetryOutcome::DependencyFailed { drained }),
        }
    }

    /// Apply buffered events in order.
    ///
    /// Each head leaves the buffer only after it was applied, re-routed or
    /// dead-lettered; an error in between leaves it first in line for the
    /// redelivered record.
    fn drain_buffer(&self, key: &str) -> Result<Drain, RetryWorkerError> {
        let mut drained = 0;

        while let Some(BufferedEvent { envelope, headers }) = self.state.peek_buffered(key)? {
            let err = match self.applier.apply(&envelope) {
                Ok(_) => {
                    self.state.advance_buffer(key)?;
                    drained += 1;
                    continue;
                }
                Err(ApplyError::Coordination(e)) => return Err(e.into()),
                Err(ApplyError::Processing(err)) => err,
            };

            match classify(&err) {
                ErrorKind::Retryable => {
                    // The failed event becomes the new head; the rest stays parked.
                    self.router
                        .route_to_next_stage(&envelope, key, 0, &err.to_string(), &headers)?;
                    self.state.advance_buffer(key)?;
                    info!(
                        key = %key,
                        event_id = %envelope.event_id(),
                        drained,
                        "buffered event failed; restarting retry chain"
                    );
                    return Ok(Drain::Parked(drained));
                }
                ErrorKind::Fatal => {
                    self.router
                        .send_to_dlt(&envelope, key, "fatal-error", &err.to_string(), &headers)?;
                    self.state.advance_buffer(key)?;
                    if envelope.is_creation() {
                        self.abandon_key(key, true)?;
                        return Ok(Drain::CreationFailed(drained));
                    }
                }
            }
        }

        Ok(Drain::Complete(drained))
    }

    /// Dead-letter every buffered dependent, reset the key and signal `DLT`.
    ///
    /// A key whose creation failed stays flagged `DLT` so later dependents are
    /// rejected without touching the store.
    fn abandon_key(&self, key: &str, creation_failed: bool) -> Result<usize, RetryWorkerError> {
        let mut dependents = 0;
        while let Some(BufferedEvent { envelope, headers }) = self.state.peek_buffered(key)? {
            self.router.send_to_dlt(
                &envelope,
                key,
                "predecessor-dead-lettered",
                "predecessor was dead-lettered",
                &headers,
            )?;
            self.state.advance_buffer(key)?;
            dependents += 1;
        }

        if creation_failed {
            self.state.mark_dlt(key)?;
        } else {
            self.state.clear_state(key)?;
        }
        self.latch.notify_result(key, RetryStatus::Dlt)?;

        warn!(key = %key, dependents, "key abandoned after dead-letter");
        Ok(dependents)
    }

    /// Honor the record's `retry-not-before`, never sleeping past the
    /// configured maximum backoff.
    fn wait_until_due(&self, headers: &Headers) {
        let Some(not_before) = headers.last_i64(headers::RETRY_NOT_BEFORE) else {
            return;
        };
        let remaining = not_before - Utc::now().timestamp_millis();
        if remaining <= 0 {
            return;
        }
        let delay = Duration::from_millis(remaining as u64).min(self.max_delay);
        debug!(delay_ms = delay.as_millis() as u64, "waiting for retry backoff");
        thread::sleep(delay);
    }
}

/// Stage hop counter carried by the record; `1` when absent or unreadable.
fn retry_count(headers: &Headers) -> u32 {
    match headers.last_u32(headers::RETRY_COUNT) {
        Some(Ok(count)) => count.max(1),
        Some(Err(raw)) => {
            warn!(raw = %raw, "unparsable retry-count header; assuming first retry");
            1
        }
        None => 1,
    }
}
