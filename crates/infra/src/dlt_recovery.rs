//! Periodic re-injection of dead-lettered records into the main topic.
//!
//! Each pass reads the dead-letter topic under its own consumer group. A record
//! whose `dlt-recovery-attempt` reached the configured bound is abandoned
//! (logged and committed); every other record is republished to the main topic
//! with the attempt counter bumped and committed afterwards.
//!
//! Passes are single-flight per process: a run that finds another one in
//! progress is skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use taxflow_events::{headers, ConsumerRecord, Headers, MessageBroker, PersonEnvelope, ProducerRecord};

use crate::config::MessagingConfig;
use crate::workers::WorkerHandle;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("dead-letter poll failed: {0}")]
    Poll(String),

    #[error("dead-letter commit failed: {0}")]
    Commit(String),

    #[error("dead-letter rollback failed: {0}")]
    Rollback(String),
}

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryPass {
    pub polled: usize,
    pub recovered: usize,
    pub abandoned: usize,
    /// Republish failures (the pass stops at the first one).
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryRun {
    /// Another pass was already running.
    Skipped,
    Completed(RecoveryPass),
}

/// Cumulative counters.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    passes: AtomicU64,
    recovered_total: AtomicU64,
    abandoned_total: AtomicU64,
    failed_total: AtomicU64,
    skipped_runs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStatsSnapshot {
    pub passes: u64,
    pub recovered_total: u64,
    pub abandoned_total: u64,
    pub failed_total: u64,
    pub skipped_runs: u64,
}

impl RecoveryStats {
    pub fn snapshot(&self) -> RecoveryStatsSnapshot {
        RecoveryStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            recovered_total: self.recovered_total.load(Ordering::Relaxed),
            abandoned_total: self.abandoned_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            skipped_runs: self.skipped_runs.load(Ordering::Relaxed),
        }
    }

    fn add_pass(&self, pass: &RecoveryPass) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.recovered_total
            .fetch_add(pass.recovered as u64, Ordering::Relaxed);
        self.abandoned_total
            .fetch_add(pass.abandoned as u64, Ordering::Relaxed);
        self.failed_total
            .fetch_add(pass.failed as u64, Ordering::Relaxed);
    }
}

/// Resets the single-flight flag when a pass ends, even by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DltRecovery<B> {
    broker: B,
    dlt_topic: String,
    main_topic: String,
    group: String,
    max_attempts: u32,
    max_records: usize,
    poll_timeout: Duration,
    running: AtomicBool,
    stats: RecoveryStats,
}

impl<B> DltRecovery<B>
where
    B: MessageBroker<PersonEnvelope>,
{
    pub fn new(broker: B, config: &MessagingConfig) -> Self {
        Self {
            broker,
            dlt_topic: config.dlt_topic(),
            main_topic: config.main_topic.clone(),
            group: config.recovery.group.clone(),
            max_attempts: config.recovery.max_attempts,
            max_records: config.consumer.max_records,
            poll_timeout: config.recovery.poll_timeout,
            running: AtomicBool::new(false),
            stats: RecoveryStats::default(),
        }
    }

    pub fn stats(&self) -> RecoveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one pass unless one is already in progress.
    pub fn run_once(&self) -> Result<RecoveryRun, RecoveryError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.skipped_runs.fetch_add(1, Ordering::Relaxed);
            info!(topic = %self.dlt_topic, "recovery pass already running; skipping");
            return Ok(RecoveryRun::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        let pass = self.run_pass()?;
        self.stats.add_pass(&pass);

        if pass.polled > 0 {
            info!(
                topic = %self.dlt_topic,
                polled = pass.polled,
                recovered = pass.recovered,
                abandoned = pass.abandoned,
                failed = pass.failed,
                "recovery pass finished"
            );
        }
        Ok(RecoveryRun::Completed(pass))
    }

    fn run_pass(&self) -> Result<RecoveryPass, RecoveryError> {
        let records = self
            .broker
            .poll(&self.dlt_topic, &self.group, self.max_records, self.poll_timeout)
            .map_err(|e| RecoveryError::Poll(e.to_string()))?;

        let mut pass = RecoveryPass {
            polled: records.len(),
            ..RecoveryPass::default()
        };

        for record in &records {
            let attempt = match record.headers.last_u32(headers::RECOVERY_ATTEMPT) {
                None => 0,
                Some(Ok(n)) => n,
                Some(Err(raw)) => {
                    warn!(key = %record.key, raw = %raw, "unparsable recovery attempt header");
                    self.max_attempts
                }
            };

            if attempt >= self.max_attempts {
                warn!(
                    key = %record.key,
                    event_id = %record.value.event_id(),
                    attempt,
                    abandoned = true,
                    reason = record.headers.last(headers::DLT_REASON).unwrap_or("unknown"),
                    "recovery attempts exhausted; abandoning record"
                );
                pass.abandoned += 1;
                self.commit(record)?;
                continue;
            }

            if let Err(err) = self.republish(record, attempt + 1) {
                error!(
                    key = %record.key,
                    event_id = %record.value.event_id(),
                    error = %err,
                    "failed to republish dead-lettered record; stopping pass"
                );
                pass.failed += 1;
                self.broker
                    .rollback(&self.dlt_topic, &self.group)
                    .map_err(|e| RecoveryError::Rollback(e.to_string()))?;
                break;
            }

            info!(
                key = %record.key,
                event_id = %record.value.event_id(),
                attempt = attempt + 1,
                "re-injected dead-lettered record"
            );
            pass.recovered += 1;
            self.commit(record)?;
        }

        Ok(pass)
    }

    fn republish(&self, record: &ConsumerRecord<PersonEnvelope>, attempt: u32) -> Result<(), B::Error> {
        let meta = Headers::new()
            .with(headers::RECOVERY_ATTEMPT, attempt)
            .with(headers::RECOVERY_TIMESTAMP, Utc::now().to_rfc3339());
        self.broker.send(
            ProducerRecord::new(&self.main_topic, record.value.key(), record.value.clone())
                .with_headers(meta),
        )
    }

    fn commit(&self, record: &ConsumerRecord<PersonEnvelope>) -> Result<(), RecoveryError> {
        self.broker
            .commit(&self.group, std::slice::from_ref(record))
            .map_err(|e| RecoveryError::Commit(e.to_string()))
    }
}

/// Drives [`DltRecovery::run_once`] on a fixed interval.
#[derive(Debug)]
pub struct RecoveryScheduler;

impl RecoveryScheduler {
    pub fn spawn<B>(
        name: &str,
        recovery: Arc<DltRecovery<B>>,
        interval: Duration,
    ) -> std::io::Result<WorkerHandle>
    where
        B: MessageBroker<PersonEnvelope> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();

        let join = thread::Builder::new().name(worker.clone()).spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if let Err(err) = recovery.run_once() {
                            warn!(worker = %worker, error = %err, "recovery pass failed");
                        }
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}
