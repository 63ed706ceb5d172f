use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, warn};

use taxflow_events::{ConsumerRecord, MessageBroker};

use crate::config::ConsumerSettings;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A poll in flight finishes first, so this can take up to the poll timeout.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// Acknowledgment for one polled batch.
///
/// Handed to the handler with the batch; committing is the handler's call so
/// it can hold the ack until every record is settled.
pub struct Ack<'a, M, B> {
    broker: &'a B,
    group: &'a str,
    records: &'a [ConsumerRecord<M>],
    _message: PhantomData<fn() -> M>,
}

impl<M, B> Ack<'_, M, B>
where
    B: MessageBroker<M>,
{
    pub fn commit(self) -> Result<(), B::Error> {
        self.broker.commit(self.group, self.records)
    }
}

/// Generic consumer worker loop.
///
/// - Polls one topic under one consumer group (bounded wait)
/// - Hands each non-empty batch to the handler together with its [`Ack`]
/// - Rolls the group back when the handler fails, so the batch is redelivered
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn a named worker thread consuming `topic` as `group`.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe).
    pub fn spawn<M, B, H, E>(
        name: &str,
        broker: B,
        topic: impl Into<String>,
        group: impl Into<String>,
        settings: ConsumerSettings,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: MessageBroker<M> + 'static,
        H: FnMut(&[ConsumerRecord<M>], Ack<'_, M, B>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = name.to_string();
        let topic = topic.into();
        let group = group.into();

        let join = thread::Builder::new().name(worker.clone()).spawn(move || {
            worker_loop(&worker, &broker, &topic, &group, &settings, shutdown_rx, &mut handler)
        })?;

        Ok(WorkerHandle::new(shutdown_tx, join))
    }
}

fn worker_loop<M, B, H, E>(
    worker: &str,
    broker: &B,
    topic: &str,
    group: &str,
    settings: &ConsumerSettings,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    B: MessageBroker<M>,
    H: FnMut(&[ConsumerRecord<M>], Ack<'_, M, B>) -> Result<(), E>,
    E: core::fmt::Display,
{
    debug!(worker = %worker, topic = %topic, group = %group, "consumer worker started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let records = match broker.poll(topic, group, settings.max_records, settings.poll_timeout) {
            Ok(records) => records,
            Err(err) => {
                warn!(worker = %worker, topic = %topic, error = %err, "poll failed");
                thread::sleep(settings.poll_timeout);
                continue;
            }
        };
        if records.is_empty() {
            continue;
        }

        let ack = Ack {
            broker,
            group,
            records: &records,
            _message: PhantomData,
        };

        if let Err(err) = handler(&records, ack) {
            warn!(
                worker = %worker,
                topic = %topic,
                records = records.len(),
                error = %err,
                "batch handler failed; rolling back for redelivery"
            );
            if let Err(err) = broker.rollback(topic, group) {
                warn!(worker = %worker, topic = %topic, error = %err, "rollback failed");
            }
        }
    }

    debug!(worker = %worker, topic = %topic, "consumer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use taxflow_events::{InMemoryBroker, ProducerRecord};

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            poll_timeout: Duration::from_millis(20),
            ..ConsumerSettings::default()
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn committed_batches_are_not_redelivered() {
        let broker = Arc::new(InMemoryBroker::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = ConsumerWorker::spawn(
            "consumer-test",
            broker.clone(),
            "t",
            "g",
            settings(),
            move |records: &[ConsumerRecord<u32>], ack| {
                sink.lock().unwrap().extend(records.iter().map(|r| r.value));
                ack.commit()
            },
        )
        .unwrap();

        for v in 0..5 {
            broker.send(ProducerRecord::new("t", "k", v)).unwrap();
        }
        wait_until(|| seen.lock().unwrap().len() >= 5);
        handle.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(broker.lag("t", "g"), 0);
    }

    #[test]
    fn failed_handler_rolls_back_and_sees_batch_again() {
        let broker = Arc::new(InMemoryBroker::<u32>::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = calls.clone();
        let handle = ConsumerWorker::spawn(
            "consumer-rollback-test",
            broker.clone(),
            "t",
            "g",
            settings(),
            move |records: &[ConsumerRecord<u32>], ack| {
                let mut calls = sink.lock().unwrap();
                calls.push(records.len());
                if calls.len() == 1 {
                    return Err("store down".to_string());
                }
                ack.commit().map_err(|e| e.to_string())
            },
        )
        .unwrap();

        broker.send(ProducerRecord::new("t", "k", 7)).unwrap();
        wait_until(|| calls.lock().unwrap().len() >= 2);
        handle.shutdown();

        assert_eq!(calls.lock().unwrap()[..2], [1, 1]);
        assert_eq!(broker.lag("t", "g"), 0);
    }

    #[test]
    fn shutdown_stops_the_thread() {
        let broker = Arc::new(InMemoryBroker::<u32>::new());
        let handle = ConsumerWorker::spawn(
            "consumer-idle-test",
            broker,
            "t",
            "g",
            settings(),
            |_: &[ConsumerRecord<u32>], ack| ack.commit(),
        )
        .unwrap();

        assert!(!handle.is_finished());
        handle.shutdown();
    }
}
