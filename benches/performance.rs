//! Performance benchmarks for event routing and dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use marketlink::{
    CorrelationId, CorrelationRegistry, Event, EventDispatcherConfig, EventKind,
    LoopbackTransport, Message, MessageType, OperationKind, Session, SessionOptions,
    SubscriptionList, SubscriptionPreprocessMode,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKENS: i64 = 64;

fn subscribe_tokens(session: &Session, transport: &LoopbackTransport) -> Vec<CorrelationId> {
    let tokens: Vec<CorrelationId> = (0..TOKENS).map(CorrelationId::from_int).collect();
    let mut list = SubscriptionList::new();
    for (i, token) in tokens.iter().enumerate() {
        list.add(format!("TICKER{} US Equity", i), Some(token.clone()));
    }
    session
        .subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError)
        .unwrap();
    transport.deliver(Event::new(
        EventKind::SubscriptionStatus,
        tokens
            .iter()
            .map(|t| Message::status(MessageType::SubscriptionStarted, t.clone()))
            .collect(),
    ));
    tokens
}

fn ticks(tokens: &[CorrelationId], seq: u64) -> Event {
    Event::new(
        EventKind::SubscriptionData,
        tokens
            .iter()
            .map(|t| Message::data("MarketDataEvents", t.clone(), json!({"seq": seq})))
            .collect(),
    )
}

/// Benchmark correlation id registration and release
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("allocate_release", |b| {
        let registry = CorrelationRegistry::new();
        b.iter(|| {
            let token = registry.allocate(None, OperationKind::Request).unwrap();
            black_box(registry.release(&token));
        });
    });

    group.bench_function("lookup_hit", |b| {
        let registry = CorrelationRegistry::new();
        for i in 0..1000 {
            registry
                .allocate(Some(CorrelationId::from_int(i)), OperationKind::Subscription)
                .unwrap();
        }
        let token = CorrelationId::from_int(500);
        b.iter(|| black_box(registry.lookup(&token)));
    });

    group.finish();
}

/// Benchmark routing into the poll queue
fn bench_polling_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("polling_route");
    group.throughput(Throughput::Elements(TOKENS as u64));

    let transport = Arc::new(LoopbackTransport::new());
    let session = Session::new(SessionOptions::default(), transport.clone(), None, None).unwrap();
    session.start();
    let tokens = subscribe_tokens(&session, &transport);

    let mut seq = 0;
    group.bench_function("route_and_poll", |b| {
        b.iter(|| {
            seq += 1;
            transport.deliver(ticks(&tokens, seq));
            while let Some(event) = session.try_next_event().unwrap() {
                black_box(event);
            }
        });
    });

    group.finish();
    session.stop();
}

/// Benchmark handler dispatch with varying worker counts
fn bench_worker_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_dispatch");
    group.throughput(Throughput::Elements(TOKENS as u64));

    for workers in [1, 4] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            let handled = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&handled);
            let transport = Arc::new(LoopbackTransport::new());
            let session = Session::with_handler(
                SessionOptions::default(),
                transport.clone(),
                Some(EventDispatcherConfig { num_threads: workers }),
                move |event: &Event, _: &Session| {
                    if event.kind == EventKind::SubscriptionData {
                        counter.fetch_add(event.messages.len(), Ordering::Relaxed);
                    }
                },
            )
            .unwrap();
            session.start();
            let tokens = subscribe_tokens(&session, &transport);

            b.iter_custom(|iters| {
                let target = handled.load(Ordering::Relaxed) + iters as usize * tokens.len();
                let start = Instant::now();
                for seq in 0..iters {
                    transport.deliver(ticks(&tokens, seq));
                }
                let deadline = start + Duration::from_secs(30);
                while handled.load(Ordering::Relaxed) < target && Instant::now() < deadline {
                    std::hint::spin_loop();
                }
                start.elapsed()
            });

            session.stop();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_registry, bench_polling_route, bench_worker_dispatch);
criterion_main!(benches);
