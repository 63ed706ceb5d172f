//! Background worker threads.

pub mod consumer_worker;

pub use consumer_worker::{Ack, ConsumerWorker, WorkerHandle};
