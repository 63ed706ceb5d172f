//! Keyed batch-ordering engine for the main topic.
//!
//! A polled batch is grouped by key (keeping each key's intra-batch order) and
//! every key is walked through a small state machine:
//!
//! ```text
//!              ┌─────────── key flagged DLT, not a Create ──────────→ dead-letter
//!   event ─────┼─────────── key flagged RETRYING ─→ wait on latch ─┬→ SUCCESS → attempt
//!              │                                                   └→ DLT / TIMEOUT → dead-letter
//!              └─────────── otherwise ─→ attempt ─┬→ ok → next event
//!                                                 ├→ FATAL → dead-letter (Create: flag DLT)
//!                                                 └→ RETRYABLE → flag RETRYING,
//!                                                    buffer the rest, publish stage 1
//! ```
//!
//! The batch is acknowledged only after every key's walk finished. Keys run one
//! after the other or on a bounded scoped pool, depending on
//! [`KeyParallelism`]; either way the join happens before the ack.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use taxflow_events::{ConsumerRecord, Headers, MessageBroker, PersonEnvelope};

use crate::applier::{ApplyError, ApplyOutcome, EventApplier};
use crate::config::{KeyParallelism, MessagingConfig};
use crate::coordination::{
    BufferedEvent, CoordinationError, CoordinationStore, KeyState, RetryLatch, RetryStateStore,
    RetryStatus,
};
use crate::persistence::PersonStore;
use crate::retry::{classify, ErrorKind, RetryRouter, RouterError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("batch acknowledgment failed: {0}")]
    Ack(String),

    #[error("key worker panicked: {0}")]
    WorkerPanicked(String),
}

/// What happened to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub keys: usize,
    pub applied: usize,
    /// Already applied earlier (redelivery).
    pub duplicates: usize,
    /// Failed retryably and sent to stage 1.
    pub retried: usize,
    /// Parked behind a retry.
    pub buffered: usize,
    pub dead_lettered: usize,
    /// Latch waits performed.
    pub waits: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.keys += other.keys;
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.retried += other.retried;
        self.buffered += other.buffered;
        self.dead_lettered += other.dead_lettered;
        self.waits += other.waits;
    }

    pub fn records(&self) -> usize {
        self.applied + self.duplicates + self.retried + self.buffered + self.dead_lettered
    }
}

type KeyGroup<'a> = (&'a str, Vec<&'a ConsumerRecord<PersonEnvelope>>);

pub struct KeyedBatchEngine<B, S, C> {
    applier: EventApplier<S, C>,
    router: RetryRouter<B>,
    state: RetryStateStore<C>,
    latch: RetryLatch<C>,
    wait_timeout: Duration,
    parallelism: KeyParallelism,
}

impl<B, S, C> KeyedBatchEngine<B, S, C>
where
    B: MessageBroker<PersonEnvelope>,
    S: PersonStore,
    C: CoordinationStore + Clone,
{
    pub fn new(broker: B, store: S, coordination: C, config: &MessagingConfig) -> Self {
        let ttl = config.retry.state_ttl;
        let state = RetryStateStore::new(coordination.clone(), ttl);
        Self {
            applier: EventApplier::new(store, state.clone()),
            router: RetryRouter::new(broker, config),
            state,
            latch: RetryLatch::new(coordination, ttl),
            wait_timeout: config.retry.wait_timeout,
            parallelism: config.consumer.key_parallelism,
        }
    }

    /// Process a polled batch and acknowledge it once every key is settled.
    ///
    /// Per-record failures are classified and routed; they never fail the
    /// batch. Coordination or broker failures do: the batch is then left
    /// unacknowledged for redelivery.
    #[instrument(skip_all, fields(records = batch.len()))]
    pub fn process<A, E>(
        &self,
        batch: &[ConsumerRecord<PersonEnvelope>],
        ack: A,
    ) -> Result<BatchReport, EngineError>
    where
        A: FnOnce() -> Result<(), E>,
        E: core::fmt::Display,
    {
        let groups = group_by_key(batch);
        let report = match self.parallelism {
            KeyParallelism::Sequential => self.run_sequential(groups)?,
            KeyParallelism::Parallel { max_workers } => self.run_parallel(groups, max_workers)?,
        };

        ack().map_err(|e| EngineError::Ack(e.to_string()))?;

        info!(
            keys = report.keys,
            applied = report.applied,
            duplicates = report.duplicates,
            retried = report.retried,
            buffered = report.buffered,
            dead_lettered = report.dead_lettered,
            "batch processed"
        );
        Ok(report)
    }

    fn run_sequential(&self, groups: Vec<KeyGroup<'_>>) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport::default();
        for (key, records) in groups {
            report.merge(self.process_key(key, &records)?);
        }
        Ok(report)
    }

    fn run_parallel(
        &self,
        groups: Vec<KeyGroup<'_>>,
        max_workers: usize,
    ) -> Result<BatchReport, EngineError> {
        let workers = max_workers.max(1).min(groups.len());
        if workers <= 1 {
            return self.run_sequential(groups);
        }

        let queue = Mutex::new(groups.into_iter().collect::<VecDeque<_>>());

        let results: Vec<thread::Result<Result<BatchReport, EngineError>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut report = BatchReport::default();
                        loop {
                            let next = match queue.lock() {
                                Ok(mut q) => q.pop_front(),
                                Err(_) => {
                                    return Err(EngineError::WorkerPanicked(
                                        "key queue lock poisoned".to_string(),
                                    ));
                                }
                            };
                            let Some((key, records)) = next else {
                                return Ok(report);
                            };
                            report.merge(self.process_key(key, &records)?);
                        }
                    })
                })
                .collect();
            // Join barrier: every key settles before the batch can be acknowledged.
            handles.into_iter().map(|h| h.join()).collect()
        });

        let mut report = BatchReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Ok(r)) => report.merge(r),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    first_error.get_or_insert(EngineError::WorkerPanicked(msg));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Walk one key's records in order.
    fn process_key(
        &self,
        key: &str,
        records: &[&ConsumerRecord<PersonEnvelope>],
    ) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport {
            keys: 1,
            ..BatchReport::default()
        };

        // A signal from an earlier, already-resolved cycle must not be read as ours.
        self.latch.clear_stale_signal(key)?;

        let mut creation_failed = false;
        let mut wait_timed_out = false;

        for (idx, record) in records.iter().enumerate() {
            let envelope = &record.value;
            let inbound = &record.headers;

            if creation_failed {
                self.dead_letter(envelope, key, "dependency-failed", "creation event for key failed", inbound)?;
                report.dead_lettered += 1;
                continue;
            }

            match self.state.state(key)? {
                Some(KeyState::Dlt) if !envelope.is_creation() => {
                    self.dead_letter(envelope, key, "key-dead-lettered", "key creation was dead-lettered", inbound)?;
                    report.dead_lettered += 1;
                    continue;
                }
                Some(KeyState::Dlt) => {
                    debug!(key = %key, event_id = %envelope.event_id(), "create resets dead-lettered key");
                    self.state.clear_state(key)?;
                }
                Some(KeyState::Retrying) => {
                    if wait_timed_out {
                        self.dead_letter(envelope, key, "retry-wait-timeout", "predecessor still retrying", inbound)?;
                        report.dead_lettered += 1;
                        continue;
                    }

                    report.waits += 1;
                    match self.latch.wait_for_result(key, self.wait_timeout)? {
                        RetryStatus::Success => {
                            debug!(key = %key, event_id = %envelope.event_id(), "predecessor retry succeeded");
                        }
                        RetryStatus::Dlt => {
                            self.dead_letter(envelope, key, "predecessor-dead-lettered", "predecessor was dead-lettered", inbound)?;
                            report.dead_lettered += 1;
                            continue;
                        }
                        RetryStatus::Timeout => {
                            warn!(
                                key = %key,
                                event_id = %envelope.event_id(),
                                timeout_ms = self.wait_timeout.as_millis() as u64,
                                "timed out waiting for predecessor retry"
                            );
                            wait_timed_out = true;
                            self.dead_letter(envelope, key, "retry-wait-timeout", "timed out waiting for predecessor retry", inbound)?;
                            report.dead_lettered += 1;
                            continue;
                        }
                    }
                }
                None => {}
            }

            let err = match self.applier.apply(envelope) {
                Ok(ApplyOutcome::Applied) => {
                    report.applied += 1;
                    continue;
                }
                Ok(ApplyOutcome::Duplicate) => {
                    report.duplicates += 1;
                    continue;
                }
                Err(ApplyError::Coordination(e)) => return Err(e.into()),
                Err(ApplyError::Processing(err)) => err,
            };

            match classify(&err) {
                ErrorKind::Fatal => {
                    self.dead_letter(envelope, key, "fatal-error", &err.to_string(), inbound)?;
                    report.dead_lettered += 1;
                    if envelope.is_creation() {
                        creation_failed = true;
                        self.state.mark_dlt(key)?;
                    }
                }
                ErrorKind::Retryable => {
                    let rest: Vec<BufferedEvent> = records[idx + 1..]
                        .iter()
                        .map(|r| BufferedEvent::new(r.value.clone(), r.headers.clone()))
                        .collect();
                    self.escalate(envelope, key, &err.to_string(), inbound, &rest)?;
                    report.retried += 1;
                    report.buffered += rest.len();
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Flag the key, park its remaining records, then publish stage 1.
    ///
    /// State goes first: a retry worker must never see a stage-1 record whose
    /// key is not flagged.
    fn escalate(
        &self,
        envelope: &PersonEnvelope,
        key: &str,
        error: &str,
        inbound: &Headers,
        rest: &[BufferedEvent],
    ) -> Result<(), EngineError> {
        self.state.mark_retrying(key)?;
        self.state.buffer(key, rest)?;

        if let Err(e) = self.router.route_to_next_stage(envelope, key, 0, error, inbound) {
            // Undo so the redelivered batch starts from a clean key.
            self.state.clear_buffer(key)?;
            self.state.clear_state(key)?;
            return Err(e.into());
        }

        if !rest.is_empty() {
            info!(key = %key, buffered = rest.len(), "buffered dependents behind retry");
        }
        Ok(())
    }

    fn dead_letter(
        &self,
        envelope: &PersonEnvelope,
        key: &str,
        reason: &str,
        error: &str,
        inbound: &Headers,
    ) -> Result<(), EngineError> {
        self.router.send_to_dlt(envelope, key, reason, error, inbound)?;
        Ok(())
    }
}

/// Group records by envelope key, keys in first-seen order.
fn group_by_key(batch: &[ConsumerRecord<PersonEnvelope>]) -> Vec<KeyGroup<'_>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<KeyGroup<'_>> = Vec::new();

    for record in batch {
        let key = record.value.key();
        match index.get(key) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(key, groups.len());
                groups.push((key, vec![record]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceError, StoreOp};
    use crate::test_support::*;
    use proptest::prelude::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn groups_keep_first_seen_key_order_and_intra_key_order() {
        let batch = records(&[
            create("TAX001"),
            create("TAX002"),
            update("TAX001", "B"),
            update("TAX002", "C"),
        ]);
        let groups = group_by_key(&batch);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "TAX001");
        assert_eq!(groups[0].1[1].value, batch[2].value);
        assert_eq!(groups[1].0, "TAX002");
    }

    #[test]
    fn clean_batch_applies_everything_and_acks_once() {
        let fx = Fixture::new();
        let acks = AtomicUsize::new(0);

        let report = fx
            .engine()
            .process(
                &records(&[create("TAX001"), update("TAX001", "B"), debt("TAX001", 500)]),
                || {
                    acks.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), Infallible>(())
                },
            )
            .unwrap();

        assert_eq!(report.applied, 3);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.store.applied_for("TAX001"),
            vec![StoreOp::Create, StoreOp::Update, StoreOp::AddDebt]
        );
        assert!(fx.dlt().is_empty());
    }

    #[test]
    fn fatal_creation_short_circuits_dependents() {
        let fx = Fixture::new();
        fx.store.fail_next(
            StoreOp::Create,
            "TAX001",
            1,
            PersistenceError::Integrity("check constraint".into()),
        );

        let report = fx
            .engine()
            .process(&records(&[create("TAX001"), update("TAX001", "B")]), no_ack)
            .unwrap();

        assert_eq!(report.dead_lettered, 2);
        assert_eq!(fx.store.attempts(StoreOp::Update, "TAX001"), 0);
        assert_eq!(fx.dlt().len(), 2);
        assert!(fx.stage(1).is_empty());
        assert_eq!(fx.state().state("TAX001").unwrap(), Some(KeyState::Dlt));
    }

    #[test]
    fn fatal_non_creation_dead_letters_once_and_continues() {
        let fx = Fixture::new();

        let report = fx
            .engine()
            .process(
                &records(&[update("TAX001", "B"), create("TAX001"), debt("TAX001", 100)]),
                no_ack,
            )
            .unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(fx.dlt().len(), 1);
        assert!(fx.stage(1).is_empty());
        assert_eq!(fx.state().state("TAX001").unwrap(), None);
    }

    #[test]
    fn dead_lettered_key_rejects_dependents_until_recreated() {
        let fx = Fixture::new();
        fx.state().mark_dlt("TAX001").unwrap();

        let report = fx
            .engine()
            .process(
                &records(&[update("TAX001", "B"), create("TAX001"), update("TAX001", "C")]),
                no_ack,
            )
            .unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(fx.state().state("TAX001").unwrap(), None);
    }

    #[test]
    fn retryable_failure_flags_buffers_and_publishes_stage_one() {
        let fx = Fixture::new();
        fx.store.fail_next(
            StoreOp::Create,
            "TAX001",
            1,
            PersistenceError::Timeout("injected".into()),
        );

        let report = fx
            .engine()
            .process(
                &records(&[
                    create("TAX001"),
                    update("TAX001", "B"),
                    debt("TAX001", 100),
                    create("TAX002"),
                ]),
                no_ack,
            )
            .unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.buffered, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(fx.stage(1).len(), 1);
        assert_eq!(fx.state().state("TAX001").unwrap(), Some(KeyState::Retrying));
        assert_eq!(fx.state().buffered_len("TAX001").unwrap(), 2);
        assert_eq!(fx.store.applied_for("TAX002"), vec![StoreOp::Create]);
    }

    #[test]
    fn retrying_key_waits_for_success_then_applies() {
        let fx = Fixture::new();
        fx.seed("TAX001");
        fx.state().mark_retrying("TAX001").unwrap();

        let state = fx.state();
        let latch = fx.latch();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state.clear_state("TAX001").unwrap();
            latch.notify_result("TAX001", RetryStatus::Success).unwrap();
        });

        let report = fx
            .engine()
            .process(&records(&[update("TAX001", "B")]), no_ack)
            .unwrap();
        resolver.join().unwrap();

        assert_eq!(report.waits, 1);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn retrying_key_dead_letters_when_predecessor_does() {
        let fx = Fixture::new();
        fx.seed("TAX001");
        fx.state().mark_retrying("TAX001").unwrap();

        let state = fx.state();
        let latch = fx.latch();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state.clear_state("TAX001").unwrap();
            latch.notify_result("TAX001", RetryStatus::Dlt).unwrap();
        });

        let report = fx
            .engine()
            .process(&records(&[update("TAX001", "B"), update("TAX001", "C")]), no_ack)
            .unwrap();
        resolver.join().unwrap();

        // First waits and is dead-lettered, second finds the key idle.
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(fx.dlt()[0].headers.last("dlt-reason"), Some("predecessor-dead-lettered"));
    }

    #[test]
    fn wait_timeout_dead_letters_without_a_second_wait() {
        let fx = Fixture::with_config(
            test_config().with_wait_timeout(Duration::from_millis(30)),
        );
        fx.state().mark_retrying("TAX001").unwrap();

        let report = fx
            .engine()
            .process(&records(&[update("TAX001", "B"), update("TAX001", "C")]), no_ack)
            .unwrap();

        assert_eq!(report.waits, 1);
        assert_eq!(report.dead_lettered, 2);
        assert_eq!(fx.store.attempts(StoreOp::Update, "TAX001"), 0);
    }

    #[test]
    fn stale_signal_is_cleared_before_waiting() {
        let fx = Fixture::with_config(
            test_config().with_wait_timeout(Duration::from_millis(30)),
        );
        fx.seed("TAX001");
        // Leftover from an earlier cycle nobody waited for.
        fx.latch().notify_result("TAX001", RetryStatus::Success).unwrap();
        fx.state().mark_retrying("TAX001").unwrap();

        let report = fx
            .engine()
            .process(&records(&[update("TAX001", "B")]), no_ack)
            .unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(fx.dlt()[0].headers.last("dlt-reason"), Some("retry-wait-timeout"));
    }

    #[test]
    fn coordination_outage_prevents_acknowledgment() {
        let fx = Fixture::new();
        fx.coordination.set_offline(true);
        let acked = AtomicUsize::new(0);

        let err = fx
            .engine()
            .process(&records(&[create("TAX001")]), || {
                acked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Infallible>(())
            })
            .unwrap_err();

        assert!(matches!(err, EngineError::Coordination(_)));
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn redelivered_batch_skips_applied_events() {
        let fx = Fixture::new();
        let batch = records(&[create("TAX001"), debt("TAX001", 250)]);

        fx.engine().process(&batch, no_ack).unwrap();
        let report = fx.engine().process(&batch, no_ack).unwrap();

        assert_eq!(report.duplicates, 2);
        let person = fx.person("TAX001").unwrap();
        assert_eq!(person.tax_debt(), 250);
    }

    #[test]
    fn parallel_keys_join_before_ack() {
        let fx = Fixture::with_config(
            test_config().with_key_parallelism(KeyParallelism::Parallel { max_workers: 4 }),
        );
        let applied_before_ack = AtomicUsize::new(0);

        let mut envs = Vec::new();
        for i in 0..20 {
            let tax = format!("TAX{i:03}");
            envs.push(create(&tax));
            envs.push(update(&tax, "B"));
            envs.push(debt(&tax, 10));
        }

        let report = fx
            .engine()
            .process(&records(&envs), || {
                applied_before_ack.store(fx.store.history().len(), Ordering::SeqCst);
                Ok::<(), Infallible>(())
            })
            .unwrap();

        assert_eq!(report.keys, 20);
        assert_eq!(report.applied, 60);
        assert_eq!(applied_before_ack.load(Ordering::SeqCst), 60);
        for i in 0..20 {
            assert_eq!(
                fx.store.applied_for(&format!("TAX{i:03}")),
                vec![StoreOp::Create, StoreOp::Update, StoreOp::AddDebt]
            );
        }
    }

    #[test]
    fn failed_stage_one_publish_unwinds_the_key() {
        let fx = Fixture::new();
        fx.store.fail_next(
            StoreOp::Create,
            "TAX001",
            1,
            PersistenceError::Timeout("injected".into()),
        );
        let engine = KeyedBatchEngine::new(
            FailingBroker,
            fx.store.clone(),
            fx.coordination.clone(),
            &fx.config,
        );

        let err = engine
            .process(&records(&[create("TAX001"), update("TAX001", "B")]), no_ack)
            .unwrap_err();

        assert!(matches!(err, EngineError::Router(_)));
        assert_eq!(fx.state().state("TAX001").unwrap(), None);
        assert_eq!(fx.state().buffered_len("TAX001").unwrap(), 0);
    }

    fn op_strategy() -> impl Strategy<Value = Vec<(usize, bool)>> {
        prop::collection::vec((0usize..4, any::<bool>()), 0..40)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn per_key_order_is_preserved(ops in op_strategy(), parallel in any::<bool>()) {
            let parallelism = if parallel {
                KeyParallelism::Parallel { max_workers: 3 }
            } else {
                KeyParallelism::Sequential
            };
            let fx = Fixture::with_config(test_config().with_key_parallelism(parallelism));

            let mut envs = Vec::new();
            let mut expected: Vec<Vec<StoreOp>> = vec![vec![StoreOp::Create]; 4];
            for k in 0..4 {
                envs.push(create(&format!("TAX{k:03}")));
            }
            for (k, is_update) in &ops {
                let tax = format!("TAX{k:03}");
                if *is_update {
                    envs.push(update(&tax, "X"));
                    expected[*k].push(StoreOp::Update);
                } else {
                    envs.push(debt(&tax, 1));
                    expected[*k].push(StoreOp::AddDebt);
                }
            }

            let report = fx.engine().process(&records(&envs), no_ack).unwrap();
            prop_assert_eq!(report.applied, envs.len());
            for (k, ops) in expected.iter().enumerate() {
                prop_assert_eq!(&fx.store.applied_for(&format!("TAX{k:03}")), ops);
            }
        }
    }
}
