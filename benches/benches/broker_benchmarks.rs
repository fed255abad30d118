use std::{hint::black_box, sync::Arc, time::Duration};

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use kurier::{
    broker::{DeliveryEngine, EventBus, Message, MetricsCollector, QueueManager},
    AgentDirectory, DeliveryGuarantee,
};

fn queue_parts() -> (Runtime, Arc<QueueManager>) {
    let rt = Runtime::new().unwrap();
    let manager = rt.block_on(async {
        let directory = Arc::new(AgentDirectory::new());
        let delivery = DeliveryEngine::new(
            directory,
            Arc::new(MetricsCollector::new()),
            Arc::new(EventBus::new()),
            1024,
        );
        QueueManager::new(
            delivery,
            Arc::new(EventBus::new()),
            100_000,
            Duration::from_millis(100),
        )
    });
    (rt, manager)
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let (rt, manager) = queue_parts();
    manager.create("bench", None).unwrap();

    c.bench_function("queue_enqueue_dequeue", |b| {
        b.to_async(&rt).iter(|| {
            let manager = manager.clone();
            async move {
                manager
                    .enqueue("bench", Message::event("p", "task", Bytes::from_static(b"x")))
                    .await
                    .unwrap();
                black_box(manager.dequeue("bench").unwrap());
            }
        })
    });
}

fn bench_send_at_most_once(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (engine, _directory) = rt.block_on(async {
        let directory = Arc::new(AgentDirectory::new());
        let engine = DeliveryEngine::new(
            directory.clone(),
            Arc::new(MetricsCollector::new()),
            Arc::new(EventBus::new()),
            1024,
        );
        (engine, directory)
    });

    // Без получателей: меряется накладная стоимость пути отправки.
    c.bench_function("send_at_most_once_no_recipients", |b| {
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            async move {
                let message = Message::event("p", "task", Bytes::from_static(b"x"));
                black_box(
                    engine
                        .send(message, DeliveryGuarantee::at_most_once())
                        .await,
                )
            }
        })
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_send_at_most_once);
criterion_main!(benches);
