//! Benchmarks for the event store hot paths.
//!
//! `append` runs on every browser signal and must stay cheap even with a
//! large resident log; `query` runs once per digest and per API call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tidemark_core::config::PrivacyConfig;
use tidemark_core::privacy::PrivacyFilter;
use tidemark_core::types::{local_date, DayWindow, EventKind, RawEvent};
use tidemark_storage::{EventStore, MemoryBlobStore, StoreSettings};

const SITES: [&str; 6] = [
    "https://github.com/rust-lang/rust/pulls?utm_source=feed",
    "https://news.ycombinator.com/item?id=4242",
    "https://docs.rs/tokio/latest/tokio/",
    "https://www.youtube.com/watch?v=abc&fbclid=x",
    "https://mail.google.com/mail/u/0/#inbox",
    "https://en.wikipedia.org/wiki/Tide",
];

fn raw_navigation(index: usize) -> RawEvent {
    RawEvent::new(EventKind::Navigation)
        .url(format!("{}&n={}", SITES[index % SITES.len()], index))
        .title(format!("Page number {}", index))
}

/// A store holding `count` events spread over the last `count` minutes.
fn populated_store(count: usize) -> EventStore {
    let settings = StoreSettings {
        flush_every: usize::MAX,
        ..StoreSettings::default()
    };
    let mut store = EventStore::load(
        Arc::new(MemoryBlobStore::new()),
        PrivacyFilter::new(PrivacyConfig::default()),
        settings,
    )
    .unwrap();

    let now = Utc::now();
    for i in 0..count {
        let ts = now - ChronoDuration::minutes((count - i) as i64);
        store.append(raw_navigation(i).at(ts), now);
    }
    store
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_store_append");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));

    // In-order append onto a 10k event log, no flush.
    group.bench_function("append_in_order_10k", |b| {
        b.iter_batched_ref(
            || populated_store(10_000),
            |store| {
                let now = Utc::now();
                store.append(raw_navigation(1).at(now), now)
            },
            BatchSize::LargeInput,
        );
    });

    // Late arrival inserted into the middle of the log.
    group.bench_function("append_out_of_order_10k", |b| {
        b.iter_batched_ref(
            || populated_store(10_000),
            |store| {
                let now = Utc::now();
                store.append(raw_navigation(2).at(now - ChronoDuration::days(3)), now)
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_query_and_flush(c: &mut Criterion) {
    let store = populated_store(20_000);
    let today = DayWindow::local(local_date(Utc::now()));

    let mut group = c.benchmark_group("event_store_read");
    group.sample_size(50);

    group.bench_function("query_day_20k", |b| b.iter(|| store.query(&today).len()));

    group.bench_function("aggregate_day_20k", |b| {
        b.iter(|| EventStore::aggregate_by_domain(store.query(&today)).len())
    });

    group.bench_function("flush_20k", |b| {
        b.iter_batched_ref(
            || populated_store(20_000),
            |store| store.flush(Utc::now()).map(|r| r.bytes_written),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_append, bench_query_and_flush);
criterion_main!(benches);
