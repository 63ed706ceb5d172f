//! Infrastructure layer: retry pipeline, coordination, persistence, brokers.
//!
//! ```text
//! main topic ─→ KeyedBatchEngine ─┬→ PersonStore
//!                                 ├→ retry-1..N ─→ RetryWorker ─┬→ PersonStore
//!                                 │                             └→ dead-letter topic
//!                                 └→ dead-letter topic ─→ DltRecovery ─→ main topic
//! ```
//!
//! Batch and retry workers agree on a key's state only through the
//! [`coordination::CoordinationStore`].

pub mod applier;
pub mod batch_engine;
pub mod broker;
pub mod config;
pub mod coordination;
pub mod dlt_recovery;
pub mod persistence;
pub mod retry;
pub mod retry_worker;
pub mod workers;

pub use applier::{ApplyError, ApplyOutcome, EventApplier};
pub use batch_engine::{BatchReport, EngineError, KeyedBatchEngine};
pub use config::{ConfigError, KeyParallelism, MessagingConfig};
pub use dlt_recovery::{DltRecovery, RecoveryError, RecoveryRun, RecoveryScheduler};
pub use retry_worker::{RetryOutcome, RetryWorker, RetryWorkerError};

#[cfg(test)]
mod test_support;
