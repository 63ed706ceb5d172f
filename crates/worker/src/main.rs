use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use taxflow_events::{ConsumerRecord, MessageBroker, PersonEnvelope};
use taxflow_infra::coordination::CoordinationStore;
use taxflow_infra::persistence::{InMemoryPersonStore, PersonStore, PostgresPersonStore};
use taxflow_infra::workers::{ConsumerWorker, WorkerHandle};
use taxflow_infra::{DltRecovery, KeyedBatchEngine, MessagingConfig, RecoveryScheduler, RetryWorker};

fn main() -> anyhow::Result<()> {
    taxflow_observability::init();

    let config = MessagingConfig::from_env().context("invalid configuration")?;
    info!(
        main_topic = %config.main_topic,
        max_retries = config.retry.max_retries,
        key_parallelism = ?config.consumer.key_parallelism,
        "starting taxflow worker"
    );

    let store: Arc<dyn PersonStore> = match &config.database_url {
        Some(url) => {
            let pg = PostgresPersonStore::connect(url).context("failed to connect to Postgres")?;
            pg.ensure_schema().context("failed to create person schema")?;
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory person store");
            Arc::new(InMemoryPersonStore::new())
        }
    };

    let (broker, coordination) = backends(&config)?;
    let handles = spawn_workers(broker, store, coordination, &config)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;

    info!(workers = handles.len(), "shutting down");
    for handle in handles {
        handle.shutdown();
    }
    Ok(())
}

#[cfg(feature = "redis")]
fn backends(
    config: &MessagingConfig,
) -> anyhow::Result<(
    Arc<taxflow_infra::broker::RedisStreamsBroker<PersonEnvelope>>,
    Arc<dyn CoordinationStore>,
)> {
    use taxflow_infra::broker::RedisStreamsBroker;
    use taxflow_infra::coordination::RedisCoordinationStore;

    let consumer = std::env::var("HOSTNAME").unwrap_or_else(|_| "taxflow-worker".to_string());
    let broker = RedisStreamsBroker::new(&config.redis_url, consumer, config.dlt_topic())
        .context("failed to open Redis broker")?;
    let coordination = RedisCoordinationStore::new(&config.redis_url)
        .context("failed to open Redis coordination store")?;
    Ok((Arc::new(broker), Arc::new(coordination)))
}

#[cfg(not(feature = "redis"))]
fn backends(
    _config: &MessagingConfig,
) -> anyhow::Result<(
    Arc<taxflow_events::InMemoryBroker<PersonEnvelope>>,
    Arc<dyn CoordinationStore>,
)> {
    use taxflow_infra::coordination::InMemoryCoordinationStore;

    warn!("built without redis; using in-process broker and coordination store");
    Ok((
        Arc::new(taxflow_events::InMemoryBroker::new()),
        Arc::new(InMemoryCoordinationStore::new()),
    ))
}

/// Main consumer, one worker per retry stage, and the recovery scheduler.
fn spawn_workers<B>(
    broker: Arc<B>,
    store: Arc<dyn PersonStore>,
    coordination: Arc<dyn CoordinationStore>,
    config: &MessagingConfig,
) -> anyhow::Result<Vec<WorkerHandle>>
where
    B: MessageBroker<PersonEnvelope> + 'static,
{
    let mut handles = Vec::new();

    let engine = KeyedBatchEngine::new(broker.clone(), store.clone(), coordination.clone(), config);
    handles.push(
        ConsumerWorker::spawn(
            "main-consumer",
            broker.clone(),
            config.main_topic.clone(),
            config.main_group(),
            config.consumer.clone(),
            move |batch: &[ConsumerRecord<PersonEnvelope>], ack| {
                engine.process(batch, || ack.commit()).map(|_| ())
            },
        )
        .context("failed to spawn main consumer")?,
    );

    for stage in 1..=config.retry.max_retries {
        let worker = RetryWorker::new(
            broker.clone(),
            store.clone(),
            coordination.clone(),
            config,
            stage,
        );
        let (topic, group) = (worker.topic().to_string(), worker.group().to_string());
        let name = format!("retry-{}", worker.stage());
        handles.push(
            ConsumerWorker::spawn(
                &name,
                broker.clone(),
                topic,
                group,
                config.consumer.clone(),
                move |batch: &[ConsumerRecord<PersonEnvelope>], ack| {
                    worker.process(batch, || ack.commit()).map(|_| ())
                },
            )
            .with_context(|| format!("failed to spawn retry-{stage} worker"))?,
        );
    }

    let recovery = Arc::new(DltRecovery::new(broker, config));
    handles.push(
        RecoveryScheduler::spawn("dlt-recovery", recovery, config.recovery.interval)
            .context("failed to spawn recovery scheduler")?,
    );

    info!(workers = handles.len(), "workers started");
    Ok(handles)
}
