use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    events::{BrokerEvent, EventBus},
    metrics::MetricsCollector,
    DeliveryGuarantee, GuaranteeKind, Message,
};
use crate::{directory::AgentDirectory, DeliveryError};

/// Хук проверки дубликатов для exactly-once.
///
/// Гарантия заявлена, но подавление дубликатов брокер не реализует:
/// точка расширения отдана наружу, дефолт всегда отвечает «не дубль».
pub trait DuplicateCheck: Send + Sync {
    fn is_duplicate(&self, message: &Message) -> bool;
}

/// Заглушка по умолчанию: дубликатов не бывает.
#[derive(Debug, Default)]
pub struct NoDedup;

impl DuplicateCheck for NoDedup {
    fn is_duplicate(&self, _message: &Message) -> bool {
        false
    }
}

/// Неподтверждённая гарантированная доставка.
pub struct PendingAck {
    pub message: Message,
    pub guarantee: DeliveryGuarantee,
    pub last_attempt: Instant,
    pub retries: u32,
}

/// Движок доставки: гарантии, повторы, подтверждения, dead-letter.
///
/// Машина состояний попытки: `Attempting -> Delivered` при успехе;
/// при сбое — `RetryScheduled`, пока `retry_count < max_retries`,
/// дальше `DeadLettered`. Отдельный обход (`sweep_pending`) применяет
/// то же правило к доставкам, зависшим без подтверждения.
pub struct DeliveryEngine {
    directory: Arc<AgentDirectory>,
    pending: DashMap<Uuid, PendingAck>,
    dead_letters: Mutex<VecDeque<Message>>,
    dead_letter_limit: usize,
    metrics: Arc<MetricsCollector>,
    events: Arc<EventBus>,
    dedup: Arc<dyn DuplicateCheck>,
    closed: AtomicBool,
    // Слабая ссылка на себя для фоновых задач повтора.
    self_ref: Weak<Self>,
}

impl DeliveryEngine {
    pub fn new(
        directory: Arc<AgentDirectory>,
        metrics: Arc<MetricsCollector>,
        events: Arc<EventBus>,
        dead_letter_limit: usize,
    ) -> Arc<Self> {
        Self::with_dedup(directory, metrics, events, dead_letter_limit, Arc::new(NoDedup))
    }

    pub fn with_dedup(
        directory: Arc<AgentDirectory>,
        metrics: Arc<MetricsCollector>,
        events: Arc<EventBus>,
        dead_letter_limit: usize,
        dedup: Arc<dyn DuplicateCheck>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            directory,
            pending: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
            dead_letter_limit,
            metrics,
            events,
            dedup,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Отправка готового сообщения с заданной гарантией.
    ///
    /// Поведение при сбое первой попытки двоякое и сохранено
    /// намеренно: ошибка возвращается вызывающему, а фоновый повтор
    /// при этом уже запланирован. Вызывающий может увидеть и отказ,
    /// и последующую успешную доставку.
    pub async fn send(
        &self,
        message: Message,
        guarantee: DeliveryGuarantee,
    ) -> Result<Uuid, DeliveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("broker is shut down".into()));
        }
        if guarantee.kind == GuaranteeKind::ExactlyOnce && self.dedup.is_duplicate(&message) {
            tracing::debug!(id = %message.id, "duplicate suppressed");
            return Ok(message.id);
        }
        let id = message.id;
        match self.deliver(&message).await {
            Ok(()) => {
                self.register_pending(message, guarantee);
                Ok(id)
            }
            Err(err) => {
                self.on_failure(message, guarantee, &err);
                Err(err)
            }
        }
    }

    /// Доставка одному или нескольким получателям. Multicast идёт
    /// конкурентно и завершается, когда завершились все ветки;
    /// медленный получатель не задерживает остальных, но результат
    /// известен только после join.
    pub async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        match message.to.as_slice() {
            [] => Ok(()),
            [single] => self.deliver_unicast(single, message).await,
            many => {
                let Some(engine) = self.self_ref.upgrade() else {
                    return Err(DeliveryError::Rejected("delivery engine dropped".into()));
                };
                let mut handles = Vec::with_capacity(many.len());
                for agent_id in many {
                    let engine = engine.clone();
                    let agent_id = agent_id.clone();
                    let message = message.clone();
                    handles.push(tokio::spawn(async move {
                        engine.deliver_unicast(&agent_id, &message).await
                    }));
                }
                let mut first_err = None;
                for handle in handles {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => first_err = first_err.or(Some(err)),
                        Err(join_err) => {
                            first_err =
                                first_err.or(Some(DeliveryError::Rejected(join_err.to_string())))
                        }
                    }
                }
                match first_err {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        }
    }

    /// Unicast-доставка: через актёрный mailbox, если он зарегистрирован,
    /// иначе напрямую в `Agent::receive`.
    pub async fn deliver_unicast(
        &self,
        agent_id: &str,
        message: &Message,
    ) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let outcome = if let Some(mailbox) = self.directory.mailbox(agent_id) {
            mailbox.cast(message.clone()).await
        } else {
            match self.directory.resolve(agent_id) {
                Some(agent) => agent.receive(message.clone()).await,
                None => Err(DeliveryError::AgentNotFound(agent_id.to_string())),
            }
        };
        match outcome {
            Ok(()) => {
                self.metrics.record_delivered(started.elapsed());
                self.events.emit(BrokerEvent::Delivered {
                    message_id: message.id,
                    agent_id: agent_id.to_string(),
                    at: Utc::now(),
                });
                Ok(())
            }
            Err(err) => {
                self.events.emit(BrokerEvent::DeliveryFailed {
                    message_id: message.id,
                    agent_id: agent_id.to_string(),
                    reason: err.to_string(),
                    at: Utc::now(),
                });
                Err(err)
            }
        }
    }

    pub(crate) fn register_pending(&self, message: Message, guarantee: DeliveryGuarantee) {
        if guarantee.kind == GuaranteeKind::AtMostOnce {
            return;
        }
        let retries = message.metadata.retry_count;
        self.pending.insert(
            message.id,
            PendingAck {
                message,
                guarantee,
                last_attempt: Instant::now(),
                retries,
            },
        );
    }

    fn on_failure(&self, message: Message, guarantee: DeliveryGuarantee, err: &DeliveryError) {
        self.metrics.record_failed();
        if message.metadata.retry_count < guarantee.retry.max_retries {
            self.schedule_retry(message, guarantee);
        } else {
            self.dead_letter(message, err.to_string());
        }
    }

    /// Планирует повтор: инкремент `retry_count`, таймер на
    /// `min(multiplier^retry_count * 1s, max_backoff)`, новая попытка.
    fn schedule_retry(&self, mut message: Message, guarantee: DeliveryGuarantee) {
        message.metadata.retry_count += 1;
        let delay = guarantee.retry.backoff_for(message.metadata.retry_count);
        tracing::debug!(
            id = %message.id,
            retry = message.metadata.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if engine.closed.load(Ordering::SeqCst) {
                return;
            }
            engine.attempt(message, guarantee).await;
        });
    }

    async fn attempt(&self, message: Message, guarantee: DeliveryGuarantee) {
        match self.deliver(&message).await {
            Ok(()) => self.register_pending(message, guarantee),
            Err(err) => self.on_failure(message, guarantee, &err),
        }
    }

    /// Подтверждение доставки: снимает запись и досрочно завершает
    /// таймлайн повторов. Возвращает `false` для неизвестного id.
    pub fn acknowledge(&self, message_id: Uuid) -> bool {
        let removed = self.pending.remove(&message_id).is_some();
        if removed {
            self.events.emit(BrokerEvent::Acknowledged {
                message_id,
                at: Utc::now(),
            });
        }
        removed
    }

    /// Снимает pending-запись без события подтверждения: доставка не
    /// состоялась, её судьбу решает вызывающий.
    pub(crate) fn forget_pending(&self, message_id: Uuid) {
        self.pending.remove(&message_id);
    }

    /// Обход неподтверждённых доставок: записи старше `staleness`
    /// повторяются или уходят в dead-letter по общему правилу.
    pub fn sweep_pending(&self, staleness: Duration) {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| now.duration_since(entry.last_attempt) >= staleness)
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            let Some((_, entry)) = self.pending.remove(&id) else {
                continue;
            };
            let mut message = entry.message;
            if entry.retries >= message.metadata.max_retries {
                self.dead_letter(message, "ack timeout".into());
                continue;
            }
            message.metadata.retry_count += 1;
            tracing::debug!(id = %message.id, retry = message.metadata.retry_count, "unacked, redelivering");
            let Some(engine) = self.self_ref.upgrade() else {
                return;
            };
            let guarantee = entry.guarantee;
            tokio::spawn(async move {
                engine.attempt(message, guarantee).await;
            });
        }
    }

    fn dead_letter(&self, message: Message, reason: String) {
        tracing::warn!(id = %message.id, subject = %message.subject, %reason, "message dead-lettered");
        self.metrics.record_dead_letter();
        self.events.emit(BrokerEvent::DeadLettered {
            message_id: message.id,
            reason,
            at: Utc::now(),
        });
        let mut letters = self.dead_letters.lock();
        letters.push_back(message);
        while letters.len() > self.dead_letter_limit {
            letters.pop_front();
        }
    }

    /// Приём переполнений и исчерпанных повторов от других компонентов.
    pub(crate) fn push_dead_letter(&self, message: Message, reason: impl Into<String>) {
        self.dead_letter(message, reason.into());
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, message_id: Uuid) -> bool {
        self.pending.contains_key(&message_id)
    }

    /// Останавливает приём новых отправок; запланированные таймеры
    /// повторов проверяют флаг и гаснут сами.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::directory::{ActorMailbox, Agent};

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

    struct FailingAgent {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for FailingAgent {
        async fn receive(&self, _message: Message) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Rejected("nope".into()))
        }
    }

    struct MailboxOnly {
        casts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ActorMailbox for MailboxOnly {
        async fn cast(&self, _message: Message) -> Result<(), DeliveryError> {
            self.casts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine_with_directory() -> (Arc<DeliveryEngine>, Arc<AgentDirectory>) {
        let directory = Arc::new(AgentDirectory::new());
        let engine = DeliveryEngine::new(
            directory.clone(),
            Arc::new(MetricsCollector::new()),
            Arc::new(EventBus::new()),
            64,
        );
        (engine, directory)
    }

    fn addressed(to: &[&str]) -> Message {
        Message::event("producer", "job.run", Bytes::from_static(b"w"))
            .with_to(to.iter().map(|s| s.to_string()).collect())
    }

    /// Тест проверяет успешный unicast и регистрацию pending-ack
    /// для at-least-once.
    #[tokio::test]
    async fn test_send_registers_pending() {
        let (engine, directory) = engine_with_directory();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register("a", Arc::new(CountingAgent { hits: hits.clone() }));

        let id = engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_least_once())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(engine.is_pending(id));
    }

    /// Тест проверяет, что at-most-once ничего не ждёт: pending
    /// не регистрируется.
    #[tokio::test]
    async fn test_at_most_once_has_no_pending() {
        let (engine, directory) = engine_with_directory();
        directory.register(
            "a",
            Arc::new(CountingAgent {
                hits: Arc::new(AtomicUsize::new(0)),
            }),
        );
        engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_most_once())
            .await
            .unwrap();
        assert_eq!(engine.pending_count(), 0);
    }

    /// Тест проверяет multicast: все получатели получают сообщение,
    /// отказ одного не блокирует остальных, но итог — ошибка.
    #[tokio::test]
    async fn test_multicast_fanout_and_join() {
        let (engine, directory) = engine_with_directory();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register("ok-1", Arc::new(CountingAgent { hits: hits.clone() }));
        directory.register("ok-2", Arc::new(CountingAgent { hits: hits.clone() }));
        directory.register(
            "bad",
            Arc::new(FailingAgent {
                attempts: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let result = engine
            .send(
                addressed(&["ok-1", "bad", "ok-2"]),
                DeliveryGuarantee::at_most_once(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    /// Тест проверяет границу повторов: вечно падающий получатель,
    /// max_retries = 3 — ровно 3 запланированных повтора, затем
    /// dead-letter с retry_count = 3.
    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_then_dead_letter() {
        let (engine, directory) = engine_with_directory();
        let attempts = Arc::new(AtomicUsize::new(0));
        directory.register(
            "flaky",
            Arc::new(FailingAgent {
                attempts: attempts.clone(),
            }),
        );

        let result = engine
            .send(addressed(&["flaky"]), DeliveryGuarantee::at_least_once())
            .await;
        // Первая попытка отдаёт отказ синхронно, повтор уже запланирован.
        assert!(result.is_err());

        // Бэкофф 2с + 4с + 8с; запас времени покрывает все таймеры.
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4); // 1 исходная + 3 повтора
        let letters = engine.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].metadata.retry_count, 3);
    }

    /// Тест проверяет, что подтверждение снимает pending и обход
    /// больше не трогает доставку.
    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_stops_sweep() {
        let (engine, directory) = engine_with_directory();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register("a", Arc::new(CountingAgent { hits: hits.clone() }));

        let id = engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_least_once())
            .await
            .unwrap();
        assert!(engine.acknowledge(id));
        assert!(!engine.acknowledge(id));

        tokio::time::sleep(Duration::from_secs(31)).await;
        engine.sweep_pending(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1); // только исходная доставка
    }

    /// Тест проверяет, что обход передоставляет зависшие доставки,
    /// а исчерпавшие max_retries уходят в dead-letter.
    #[tokio::test(start_paused = true)]
    async fn test_sweep_redelivers_stale() {
        let (engine, directory) = engine_with_directory();
        let hits = Arc::new(AtomicUsize::new(0));
        directory.register("a", Arc::new(CountingAgent { hits: hits.clone() }));

        engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_least_once())
            .await
            .unwrap();
        assert_eq!(engine.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        engine.sweep_pending(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        // Передоставлено и снова ждёт подтверждения.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(engine.pending_count(), 1);
    }

    /// Тест проверяет маршрутизацию через актёрный mailbox, когда
    /// он зарегистрирован для получателя.
    #[tokio::test]
    async fn test_mailbox_preferred_over_receive() {
        let (engine, directory) = engine_with_directory();
        let hits = Arc::new(AtomicUsize::new(0));
        let casts = Arc::new(AtomicUsize::new(0));
        directory.register("a", Arc::new(CountingAgent { hits: hits.clone() }));
        directory.register_mailbox("a", Arc::new(MailboxOnly { casts: casts.clone() }));

        engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_most_once())
            .await
            .unwrap();
        assert_eq!(casts.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Тест проверяет, что неизвестный получатель даёт `AgentNotFound`
    /// и сообщение в итоге попадает в dead-letter.
    #[tokio::test(start_paused = true)]
    async fn test_unknown_agent_dead_letters() {
        let (engine, _directory) = engine_with_directory();
        let result = engine
            .send(addressed(&["ghost"]), DeliveryGuarantee::at_least_once())
            .await;
        assert_eq!(
            result,
            Err(DeliveryError::AgentNotFound("ghost".into()))
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.dead_letters().len(), 1);
    }

    /// Тест проверяет ограничение dead-letter списка: старые
    /// вытесняются первыми.
    #[tokio::test]
    async fn test_dead_letter_limit_evicts_oldest() {
        let directory = Arc::new(AgentDirectory::new());
        let engine = DeliveryEngine::new(
            directory,
            Arc::new(MetricsCollector::new()),
            Arc::new(EventBus::new()),
            2,
        );
        for i in 0..3u8 {
            engine.push_dead_letter(
                Message::event("p", "s", Bytes::from(vec![i])),
                "overflow",
            );
        }
        let letters = engine.dead_letters();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].payload, Bytes::from(vec![1u8]));
    }

    /// Тест проверяет, что после `close` новые отправки отклоняются.
    #[tokio::test]
    async fn test_closed_engine_rejects() {
        let (engine, directory) = engine_with_directory();
        directory.register(
            "a",
            Arc::new(CountingAgent {
                hits: Arc::new(AtomicUsize::new(0)),
            }),
        );
        engine.close();
        let result = engine
            .send(addressed(&["a"]), DeliveryGuarantee::at_least_once())
            .await;
        assert!(matches!(result, Err(DeliveryError::Rejected(_))));
    }
}
