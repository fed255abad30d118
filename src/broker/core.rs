use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    batch::BatchProcessor,
    correlation::CorrelationManager,
    delivery::{DeliveryEngine, DuplicateCheck},
    events::{BrokerEvent, EventBus, EventListener},
    metrics::{MetricsCollector, MetricsSnapshot},
    pattern::{PatternHandler, PatternRouter},
    queue::{ConsumeHandler, ConsumeOptions, ConsumerHandle, QueueConfig, QueueManager, QueueStats},
    topic::{RetentionPolicy, TopicHandler, TopicRegistry, TopicStats, TopicSubscription},
    DeliveryGuarantee, Message, MessageKind,
};
use crate::{
    config::Settings,
    directory::{ActorMailbox, Agent, AgentDirectory},
    BrokerError, BrokerResult,
};

/// Хуки преобразования payload на пути публикации.
///
/// Сжатие и шифрование — дело внешних коллабораторов; брокер
/// применяет их вслепую и только на `publish`.
pub trait PayloadCodec: Send + Sync {
    fn compress(&self, payload: Bytes) -> Bytes {
        payload
    }
    fn encrypt(&self, payload: Bytes) -> Bytes {
        payload
    }
}

/// Кодек по умолчанию: payload не трогается.
#[derive(Debug, Default)]
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {}

/// Внутрипроцессный брокер сообщений.
///
/// Склеивает реестры тем, очередей и шаблонов с движком доставки,
/// пакетированием и корреляцией запрос/ответ. Все фоновые таймеры
/// (сброс пакетов, обход подтверждений, тик метрик, опрос очередей)
/// принадлежат брокеру и гасятся разом в `shutdown`.
pub struct Broker {
    settings: Settings,
    events: Arc<EventBus>,
    metrics: Arc<MetricsCollector>,
    directory: Arc<AgentDirectory>,
    topics: Arc<TopicRegistry>,
    queues: Arc<QueueManager>,
    patterns: Arc<PatternRouter>,
    delivery: Arc<DeliveryEngine>,
    correlation: CorrelationManager,
    batch: Mutex<Option<BatchProcessor>>,
    codec: Arc<dyn PayloadCodec>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Broker {
    /// Создаёт брокер и запускает его фоновые задачи.
    /// Требует работающего рантайма tokio.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_hooks(settings, Arc::new(IdentityCodec), None)
    }

    pub fn with_hooks(
        settings: Settings,
        codec: Arc<dyn PayloadCodec>,
        dedup: Option<Arc<dyn DuplicateCheck>>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsCollector::new());
        let directory = Arc::new(AgentDirectory::new());
        let delivery = match dedup {
            Some(dedup) => DeliveryEngine::with_dedup(
                directory.clone(),
                metrics.clone(),
                events.clone(),
                settings.dead_letter_limit,
                dedup,
            ),
            None => DeliveryEngine::new(
                directory.clone(),
                metrics.clone(),
                events.clone(),
                settings.dead_letter_limit,
            ),
        };
        let topics = TopicRegistry::new(events.clone());
        let queues = QueueManager::new(
            delivery.clone(),
            events.clone(),
            settings.max_queue_size,
            settings.consume_poll(),
        );
        let patterns = Arc::new(PatternRouter::new());
        let correlation = CorrelationManager::new(topics.clone(), delivery.clone());
        let (batch, batch_task) = BatchProcessor::spawn(
            settings.batch_max_size,
            settings.batch_window(),
            patterns.clone(),
            delivery.clone(),
        );

        let mut tasks = vec![batch_task];

        // Обход неподтверждённых доставок.
        {
            let delivery = delivery.clone();
            let sweep_every = settings.ack_sweep_interval();
            let staleness = settings.ack_staleness();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(sweep_every);
                tick.tick().await; // первый тик мгновенный, пропускаем
                loop {
                    tick.tick().await;
                    delivery.sweep_pending(staleness);
                }
            }));
        }

        // Пересчёт throughput.
        {
            let metrics = metrics.clone();
            let every = settings.throughput_tick();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    metrics.tick(every);
                }
            }));
        }

        tracing::info!(
            batch_max = settings.batch_max_size,
            queue_max = settings.max_queue_size,
            "broker started"
        );

        Arc::new(Self {
            settings,
            events,
            metrics,
            directory,
            topics,
            queues,
            patterns,
            delivery,
            correlation,
            batch: Mutex::new(Some(batch)),
            codec,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn validate(&self, message: &Message) -> BrokerResult<()> {
        let size = message.payload.len();
        if size > self.settings.max_message_size {
            return Err(BrokerError::PayloadTooLarge {
                size,
                limit: self.settings.max_message_size,
            });
        }
        if message.is_expired(Utc::now()) {
            return Err(BrokerError::MessageExpired);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    //  Публикация и отправка
    // ---------------------------------------------------------------

    /// Fire-and-forget публикация: сообщение уходит в пакетирующий
    /// поток, оттуда — в роутер шаблонов и (для адресованных) в
    /// движок доставки. Вызов не ждёт доставки.
    pub fn publish(&self, mut message: Message) -> BrokerResult<Uuid> {
        self.ensure_open()?;
        self.validate(&message)?;
        message.payload = self.codec.encrypt(self.codec.compress(message.payload));
        let id = message.id;
        self.metrics.record_published();
        self.events.emit(BrokerEvent::Published {
            message_id: id,
            subject: message.subject.clone(),
            at: Utc::now(),
        });
        let submitted = match self.batch.lock().as_ref() {
            Some(batch) => batch.submit(message),
            None => false,
        };
        if !submitted {
            return Err(BrokerError::Closed);
        }
        Ok(id)
    }

    /// Гарантированная адресная отправка. Возвращает id сообщения;
    /// при сбое первой попытки ошибка приходит сразу, хотя фоновый
    /// повтор уже запланирован.
    pub async fn send(
        &self,
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        guarantee: Option<DeliveryGuarantee>,
    ) -> BrokerResult<Uuid> {
        self.ensure_open()?;
        let guarantee = guarantee.unwrap_or_default();
        let mut message =
            Message::new(MessageKind::Notification, from, subject, payload).with_to(to);
        message.metadata.max_retries = guarantee.retry.max_retries;
        self.validate(&message)?;
        self.metrics.record_published();
        self.delivery
            .send(message, guarantee)
            .await
            .map_err(Into::into)
    }

    // ---------------------------------------------------------------
    //  Темы
    // ---------------------------------------------------------------

    pub fn create_topic(
        &self,
        name: &str,
        retention: Option<RetentionPolicy>,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.topics.create(name, retention)
    }

    pub fn subscribe(
        &self,
        agent_id: impl Into<String>,
        topic: &str,
        handler: TopicHandler,
    ) -> BrokerResult<TopicSubscription> {
        self.ensure_open()?;
        self.topics.subscribe(agent_id, topic, handler)
    }

    pub fn publish_to_topic(&self, topic: &str, message: Message) -> BrokerResult<usize> {
        self.ensure_open()?;
        self.validate(&message)?;
        self.metrics.record_published();
        self.topics.publish(topic, message)
    }

    /// Удержанная история темы.
    pub fn replay(&self, topic: &str) -> BrokerResult<Vec<Message>> {
        self.topics.replay(topic)
    }

    pub fn topic_stats(&self, name: &str) -> BrokerResult<TopicStats> {
        self.topics.stats(name)
    }

    // ---------------------------------------------------------------
    //  Очереди
    // ---------------------------------------------------------------

    pub fn create_queue(&self, name: &str, config: Option<QueueConfig>) -> BrokerResult<()> {
        self.ensure_open()?;
        self.queues.create(name, config)
    }

    pub async fn enqueue(&self, queue: &str, message: Message) -> BrokerResult<()> {
        self.ensure_open()?;
        self.validate(&message)?;
        self.queues.enqueue(queue, message).await
    }

    pub fn dequeue(&self, queue: &str) -> BrokerResult<Option<Message>> {
        self.ensure_open()?;
        self.queues.dequeue(queue)
    }

    pub fn consume(
        &self,
        agent_id: impl Into<String>,
        queue: &str,
        handler: ConsumeHandler,
        opts: ConsumeOptions,
    ) -> BrokerResult<ConsumerHandle> {
        self.ensure_open()?;
        self.queues.consume(agent_id, queue, handler, opts)
    }

    pub fn queue_stats(&self, name: &str) -> BrokerResult<QueueStats> {
        self.queues.stats(name)
    }

    // ---------------------------------------------------------------
    //  Шаблоны
    // ---------------------------------------------------------------

    pub fn register_pattern(
        &self,
        pattern: &str,
        agent_id: impl Into<String>,
        handler: PatternHandler,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let agent_id = agent_id.into();
        self.patterns.register(pattern, agent_id.clone(), handler)?;
        self.events.emit(BrokerEvent::PatternRegistered {
            pattern: pattern.to_string(),
            agent_id,
            at: Utc::now(),
        });
        Ok(())
    }

    // ---------------------------------------------------------------
    //  Запрос/ответ
    // ---------------------------------------------------------------

    pub async fn request(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> BrokerResult<Bytes> {
        self.ensure_open()?;
        self.metrics.record_published();
        self.correlation
            .request(from, to, subject, payload.into(), timeout)
            .await
    }

    pub fn reply(&self, original: &Message, payload: impl Into<Bytes>) -> BrokerResult<()> {
        self.ensure_open()?;
        self.correlation.reply(original, payload.into())
    }

    /// Подтверждение гарантированной доставки.
    pub fn acknowledge(&self, message_id: Uuid) -> bool {
        self.delivery.acknowledge(message_id)
    }

    // ---------------------------------------------------------------
    //  Справочник агентов и наблюдаемость
    // ---------------------------------------------------------------

    pub fn register_agent(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.directory.register(agent_id, agent);
    }

    pub fn unregister_agent(&self, agent_id: &str) {
        self.directory.unregister(agent_id);
    }

    pub fn register_mailbox(&self, agent_id: impl Into<String>, mailbox: Arc<dyn ActorMailbox>) {
        self.directory.register_mailbox(agent_id, mailbox);
    }

    pub fn on_event(&self, listener: EventListener) {
        self.events.on(listener);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Брокерный dead-letter список, от старых к новым.
    pub fn dead_letters(&self) -> Vec<Message> {
        self.delivery.dead_letters()
    }

    /// Останавливает брокер: новые операции получают `Closed`,
    /// фоновые таймеры гаснут разом; занесённая в полёт работа не
    /// дожидается завершения.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("broker shutting down");
        self.events.emit(BrokerEvent::Shutdown { at: Utc::now() });
        self.delivery.close();
        // Циклы опроса консьюмеров гаснут на ближайшем тике.
        self.queues.close();
        // Сброс подачи пакетов: канал закрывается, цикл дойдёт сам.
        self.batch.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
