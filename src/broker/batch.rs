use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};

use super::{delivery::DeliveryEngine, pattern::PatternRouter, DeliveryGuarantee, Message};

/// Пакетирующий конвейер публикаций.
///
/// Каждый `publish` кладёт сообщение в общий поток; накопленный пакет
/// сбрасывается по достижении порога размера или по истечении окна —
/// что наступит раньше. Сброс по размеру перезапускает и окно.
/// Публикующая сторона не видит backpressure от этой стадии:
/// канал не ограничен, сброс идёт в фоновой задаче.
pub struct BatchProcessor {
    tx: mpsc::UnboundedSender<Message>,
}

impl BatchProcessor {
    /// Запускает фоновый цикл сброса и возвращает ручку подачи
    /// вместе с `JoinHandle` цикла (владелец гасит его при останове).
    pub fn spawn(
        max_size: usize,
        window: Duration,
        router: Arc<PatternRouter>,
        delivery: Arc<DeliveryEngine>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let task = tokio::spawn(async move {
            let mut batch: Vec<Message> = Vec::with_capacity(max_size);
            'outer: loop {
                let deadline = tokio::time::sleep(window);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        received = rx.recv() => match received {
                            Some(message) => {
                                batch.push(message);
                                if batch.len() >= max_size {
                                    break;
                                }
                            }
                            None => {
                                // Подача закрыта: досбрасываем хвост.
                                flush(&mut batch, &router, &delivery);
                                break 'outer;
                            }
                        },
                        _ = &mut deadline => break,
                    }
                }
                flush(&mut batch, &router, &delivery);
            }
        });
        (Self { tx }, task)
    }

    /// Подаёт сообщение в поток пакетирования; `false`, если цикл
    /// сброса уже остановлен.
    pub fn submit(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

fn flush(batch: &mut Vec<Message>, router: &Arc<PatternRouter>, delivery: &Arc<DeliveryEngine>) {
    if batch.is_empty() {
        return;
    }
    tracing::trace!(len = batch.len(), "flushing batch");
    for message in batch.drain(..) {
        router.dispatch(&message);
        if !message.to.is_empty() {
            let delivery = delivery.clone();
            tokio::spawn(async move {
                // Ошибка уже обработана движком (повтор/dead-letter),
                // здесь она только фиксируется в логе.
                if let Err(err) = delivery.send(message, DeliveryGuarantee::default()).await {
                    tracing::debug!(%err, "batched delivery failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        broker::{events::EventBus, metrics::MetricsCollector},
        directory::{Agent, AgentDirectory},
        DeliveryError,
    };

    struct CountingAgent {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        async fn receive(&self, _message: Message) -> Result<(), DeliveryError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn parts() -> (Arc<PatternRouter>, Arc<DeliveryEngine>, Arc<AgentDirectory>) {
        let directory = Arc::new(AgentDirectory::new());
        let delivery = DeliveryEngine::new(
            directory.clone(),
            Arc::new(MetricsCollector::new()),
            Arc::new(EventBus::new()),
            64,
        );
        (Arc::new(PatternRouter::new()), delivery, directory)
    }

    /// Тест проверяет сброс по порогу размера, не дожидаясь окна.
    #[tokio::test(start_paused = true)]
    async fn test_size_triggered_flush() {
        let (router, delivery, _dir) = parts();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        router
            .register("evt.#", "observer", Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let (proc_, task) =
            BatchProcessor::spawn(3, Duration::from_secs(3600), router, delivery);
        for _ in 0..3 {
            assert!(proc_.submit(Message::event("p", "evt.a", Bytes::new())));
        }
        // Далеко до конца окна: срабатывает порог размера.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(proc_);
        let _ = task.await;
    }

    /// Тест проверяет сброс по истечении временного окна.
    #[tokio::test(start_paused = true)]
    async fn test_window_triggered_flush() {
        let (router, delivery, _dir) = parts();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        router
            .register("evt.#", "observer", Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let (proc_, task) =
            BatchProcessor::spawn(100, Duration::from_millis(50), router, delivery);
        proc_.submit(Message::event("p", "evt.a", Bytes::new()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(proc_);
        let _ = task.await;
    }

    /// Тест проверяет, что адресованные сообщения из пакета уходят
    /// в движок доставки с гарантией по умолчанию.
    #[tokio::test(start_paused = true)]
    async fn test_addressed_messages_reach_delivery() {
        let (router, delivery, directory) = parts();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register("worker", Arc::new(CountingAgent { hits: hits.clone() }));

        let (proc_, task) =
            BatchProcessor::spawn(1, Duration::from_millis(50), router, delivery.clone());
        proc_.submit(
            Message::event("p", "job.run", Bytes::new()).with_to(vec!["worker".into()]),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // at-least-once: доставка ждёт подтверждения.
        assert_eq!(delivery.pending_count(), 1);
        drop(proc_);
        let _ = task.await;
    }

    /// Тест проверяет, что закрытие подачи досбрасывает остаток.
    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_tail() {
        let (router, delivery, _dir) = parts();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        router
            .register("evt.#", "observer", Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        let (proc_, task) =
            BatchProcessor::spawn(100, Duration::from_secs(3600), router, delivery);
        proc_.submit(Message::event("p", "evt.a", Bytes::new()));
        proc_.submit(Message::event("p", "evt.b", Bytes::new()));
        drop(proc_);
        let _ = task.await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
