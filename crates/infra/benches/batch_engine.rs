use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::convert::Infallible;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use taxflow_core::{DebtAmount, PersonSnapshot, TaxNumber};
use taxflow_events::{ConsumerRecord, Headers, InMemoryBroker, PersonEnvelope};
use taxflow_infra::coordination::InMemoryCoordinationStore;
use taxflow_infra::persistence::InMemoryPersonStore;
use taxflow_infra::retry::BackoffPolicy;
use taxflow_infra::{KeyParallelism, KeyedBatchEngine, MessagingConfig};

type Engine = KeyedBatchEngine<
    Arc<InMemoryBroker<PersonEnvelope>>,
    Arc<InMemoryPersonStore>,
    Arc<InMemoryCoordinationStore>,
>;

fn engine(parallelism: KeyParallelism) -> Engine {
    let config = MessagingConfig::default()
        .with_backoff(BackoffPolicy::immediate())
        .with_key_parallelism(parallelism);
    KeyedBatchEngine::new(
        Arc::new(InMemoryBroker::new()),
        Arc::new(InMemoryPersonStore::new()),
        Arc::new(InMemoryCoordinationStore::new()),
        &config,
    )
}

/// `keys` people, each created, updated and charged once.
fn batch(keys: usize) -> Vec<ConsumerRecord<PersonEnvelope>> {
    let dob = NaiveDate::from_ymd_opt(1980, 1, 1).unwrap();
    let mut envelopes = Vec::with_capacity(keys * 3);
    for k in 0..keys {
        let tax = TaxNumber::parse(&format!("TAX{:03}", k % 1000)).unwrap();
        envelopes.push(PersonEnvelope::create(PersonSnapshot::new(tax.clone(), "Jane", "Doe", dob)));
        envelopes.push(PersonEnvelope::update(PersonSnapshot::new(tax.clone(), "Janet", "Doe", dob)));
        envelopes.push(PersonEnvelope::add_debt(tax, DebtAmount::from_cents(1_000).unwrap()));
    }

    envelopes
        .into_iter()
        .enumerate()
        .map(|(offset, env)| ConsumerRecord {
            topic: "person.events".to_string(),
            partition: 0,
            offset: offset as u64,
            key: env.key().to_string(),
            value: env,
            headers: Headers::new(),
            timestamp: Utc::now(),
            receipt: offset.to_string(),
        })
        .collect()
}

fn bench_clean_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_batch");

    for keys in [10usize, 100, 500].iter() {
        let records = batch(*keys);
        group.throughput(Throughput::Elements(records.len() as u64));

        for (label, parallelism) in [
            ("sequential", KeyParallelism::Sequential),
            ("parallel_4", KeyParallelism::Parallel { max_workers: 4 }),
        ] {
            group.bench_with_input(BenchmarkId::new(label, keys), &records, |b, records| {
                b.iter_batched(
                    || engine(parallelism),
                    |engine| {
                        let report = engine
                            .process(black_box(records), || Ok::<(), Infallible>(()))
                            .unwrap();
                        black_box(report)
                    },
                    BatchSize::SmallInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_clean_batch);
criterion_main!(benches);
