use std::{hint::black_box, sync::Arc};

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use kurier::{
    broker::{Message, PatternRouter, SubjectPattern},
    BrokerResult,
};

fn subjects(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("sensor.room{}.temp", i % 32))
        .collect()
}

fn bench_pattern_compile(c: &mut Criterion) {
    c.bench_function("pattern_compile_star", |b| {
        b.iter(|| SubjectPattern::compile(black_box("sensor.*.temp")))
    });
    c.bench_function("pattern_compile_hash", |b| {
        b.iter(|| SubjectPattern::compile(black_box("sensor.#")))
    });
}

fn bench_pattern_match(c: &mut Criterion) {
    let star = SubjectPattern::compile("sensor.*.temp").unwrap();
    let hash = SubjectPattern::compile("orders.#.shipped").unwrap();
    c.bench_function("pattern_match_star", |b| {
        b.iter(|| star.matches(black_box("sensor.room7.temp")))
    });
    c.bench_function("pattern_match_hash_deep", |b| {
        b.iter(|| hash.matches(black_box("orders.eu.de.berlin.shipped")))
    });
}

fn bench_router_dispatch(c: &mut Criterion) -> BrokerResult<()> {
    let router = PatternRouter::new();
    for i in 0..16 {
        router.register(
            &format!("sensor.room{i}.*"),
            format!("agent-{i}"),
            Arc::new(|_| {}),
        )?;
    }
    router.register("sensor.#", "collector", Arc::new(|_| {}))?;

    let messages: Vec<Message> = subjects(256)
        .into_iter()
        .map(|s| Message::event("bench", s, Bytes::from_static(b"t")))
        .collect();

    c.bench_function("router_dispatch_256", |b| {
        b.iter(|| {
            for message in &messages {
                black_box(router.dispatch(message));
            }
        })
    });
    Ok(())
}

fn all(c: &mut Criterion) {
    bench_pattern_compile(c);
    bench_pattern_match(c);
    bench_router_dispatch(c).expect("router setup");
}

criterion_group!(benches, all);
criterion_main!(benches);
