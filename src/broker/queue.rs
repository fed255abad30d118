use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::{
    delivery::DeliveryEngine,
    events::{BrokerEvent, EventBus},
    DeliveryGuarantee, Message,
};
use crate::{BrokerError, BrokerResult};

/// Сколько раз сообщение возвращается в очередь после ошибки
/// обработчика, прежде чем уйти в dead-letter.
const CONSUMER_REQUEUE_LIMIT: u32 = 3;

/// Обработчик консьюмера; ошибка запускает повторную постановку.
pub type ConsumeHandler = Arc<dyn Fn(Message) -> BrokerResult<()> + Send + Sync>;

/// Конфигурация очереди.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Ёмкость; `None` — глобальный лимит брокера.
    pub max_size: Option<usize>,
    /// Упорядочивать по приоритету вместо FIFO.
    pub priority: bool,
    /// Переживает рестарт; носится как данные, стора не подключено.
    pub persistent: bool,
    /// Ровно один консьюмер.
    pub exclusive: bool,
    /// Удалить очередь, когда она опустела и осталась без консьюмеров.
    pub auto_delete: bool,
    /// Очередь-приёмник переполнений.
    pub dlq: Option<String>,
}

/// Опции подписки-консьюмера.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// При `false` снятое сообщение числится неподтверждённым:
    /// успешный обработчик подтверждает его через движок доставки,
    /// что видно как событие `Acknowledged`.
    pub auto_ack: bool,
    pub poll_interval: Option<Duration>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            poll_interval: None,
        }
    }
}

/// Статистика очереди.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub name: String,
    pub depth: usize,
    pub consumer_count: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub created: DateTime<Utc>,
}

struct QueueInner {
    messages: VecDeque<Message>,
    consumers: Vec<String>,
    rr_index: usize,
    config: QueueConfig,
    max_size: usize,
    created: DateTime<Utc>,
    enqueued: u64,
    dequeued: u64,
}

impl QueueInner {
    /// Вставка с учётом приоритета: перед первым элементом со строго
    /// меньшим приоритетом; равные сохраняют порядок прихода.
    fn insert(&mut self, message: Message) {
        if self.config.priority {
            let pos = self
                .messages
                .iter()
                .position(|m| m.metadata.priority < message.metadata.priority);
            match pos {
                Some(i) => self.messages.insert(i, message),
                None => self.messages.push_back(message),
            }
        } else {
            self.messages.push_back(message);
        }
        self.enqueued += 1;
    }
}

/// Менеджер именованных point-to-point очередей.
///
/// Очереди создаются явно; переполнение уводит сообщение в DLQ
/// очереди (по цепочке) либо в брокерный dead-letter список — сама
/// очередь при этом не растёт. Каждая успешная постановка запускает
/// проход раздачи: round-robin по консьюмерам через unicast движка
/// доставки, с бюджетом в длину очереди на момент входа.
pub struct QueueManager {
    queues: DashMap<String, QueueInner>,
    delivery: Arc<DeliveryEngine>,
    events: Arc<EventBus>,
    default_max_size: usize,
    default_poll: Duration,
    closed: AtomicBool,
    // Слабая ссылка на себя для циклов опроса и ручек консьюмеров.
    self_ref: Weak<Self>,
}

impl QueueManager {
    pub fn new(
        delivery: Arc<DeliveryEngine>,
        events: Arc<EventBus>,
        default_max_size: usize,
        default_poll: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            queues: DashMap::new(),
            delivery,
            events,
            default_max_size,
            default_poll,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn create(&self, name: &str, config: Option<QueueConfig>) -> BrokerResult<()> {
        if self.queues.contains_key(name) {
            return Err(BrokerError::QueueExists(name.to_string()));
        }
        let config = config.unwrap_or_default();
        let max_size = config.max_size.unwrap_or(self.default_max_size);
        self.queues.insert(
            name.to_string(),
            QueueInner {
                messages: VecDeque::new(),
                consumers: Vec::new(),
                rr_index: 0,
                config,
                max_size,
                created: Utc::now(),
                enqueued: 0,
                dequeued: 0,
            },
        );
        tracing::debug!(queue = name, "queue created");
        self.events.emit(BrokerEvent::QueueCreated {
            name: name.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Постановка в очередь. Переполнение — не ошибка постановки:
    /// сообщение считается принятым и уходит по цепочке DLQ либо в
    /// брокерный dead-letter список. Цикл в цепочке DLQ обрывается
    /// на первом повторе имени — сообщение уходит в брокерный список.
    pub async fn enqueue(&self, name: &str, message: Message) -> BrokerResult<()> {
        if !self.queues.contains_key(name) {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        }
        let mut target = name.to_string();
        let mut visited = vec![target.clone()];
        let msg = message;
        loop {
            let dlq: Option<String>;
            {
                let Some(mut inner) = self.queues.get_mut(&target) else {
                    // Настроенный DLQ не существует.
                    self.delivery
                        .push_dead_letter(msg, format!("dlq {target} missing"));
                    return Ok(());
                };
                // Проверка ёмкости и вставка атомарны под шардом.
                if inner.messages.len() < inner.max_size {
                    let id = msg.id;
                    inner.insert(msg);
                    drop(inner);
                    self.events.emit(BrokerEvent::Enqueued {
                        queue: target.clone(),
                        message_id: id,
                        at: Utc::now(),
                    });
                    self.dispatch(&target).await;
                    return Ok(());
                }
                dlq = inner.config.dlq.clone();
            }
            match dlq {
                Some(next) => {
                    if visited.iter().any(|v| v == &next) {
                        tracing::warn!(queue = %target, dlq = %next, "dlq chain loops");
                        self.delivery
                            .push_dead_letter(msg, format!("dlq cycle at {next}"));
                        return Ok(());
                    }
                    tracing::debug!(queue = %target, dlq = %next, "queue full, rerouting");
                    visited.push(next.clone());
                    target = next;
                }
                None => {
                    self.delivery
                        .push_dead_letter(msg, format!("queue {target} overflow"));
                    return Ok(());
                }
            }
        }
    }

    /// Проход раздачи: пока очередь непуста и есть консьюмеры,
    /// голова уходит следующему по кругу. Успех снимает голову,
    /// отказ оставляет её на месте и двигает круг дальше — очередь
    /// с падающим получателем осознанно стопорится (backpressure).
    pub async fn dispatch(&self, name: &str) {
        let mut budget = match self.queues.get(name) {
            Some(inner) => inner.messages.len(),
            None => return,
        };
        while budget > 0 {
            let (message, consumer) = {
                let Some(mut inner) = self.queues.get_mut(name) else {
                    return;
                };
                if inner.messages.is_empty() || inner.consumers.is_empty() {
                    return;
                }
                let idx = inner.rr_index % inner.consumers.len();
                inner.rr_index = inner.rr_index.wrapping_add(1);
                let consumer = inner.consumers[idx].clone();
                let head = inner.messages.front().cloned();
                match head {
                    Some(m) => (m, consumer),
                    None => return,
                }
            };
            if self
                .delivery
                .deliver_unicast(&consumer, &message)
                .await
                .is_ok()
            {
                if let Some(mut inner) = self.queues.get_mut(name) {
                    // Снимаем голову, только если это всё то же сообщение.
                    if inner.messages.front().map(|m| m.id) == Some(message.id) {
                        inner.messages.pop_front();
                        inner.dequeued += 1;
                    }
                }
                self.events.emit(BrokerEvent::Dequeued {
                    queue: name.to_string(),
                    message_id: message.id,
                    at: Utc::now(),
                });
            }
            budget -= 1;
        }
    }

    /// Снимает голову очереди. Если после этого очередь пуста, без
    /// консьюмеров и помечена `auto_delete` — удаляется как побочный
    /// эффект этого вызова.
    pub fn dequeue(&self, name: &str) -> BrokerResult<Option<Message>> {
        let (message, auto_delete) = {
            let mut inner = self
                .queues
                .get_mut(name)
                .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
            let message = inner.messages.pop_front();
            if message.is_some() {
                inner.dequeued += 1;
            }
            let auto_delete = inner.config.auto_delete
                && inner.messages.is_empty()
                && inner.consumers.is_empty();
            (message, auto_delete)
        };
        if let Some(m) = &message {
            self.events.emit(BrokerEvent::Dequeued {
                queue: name.to_string(),
                message_id: m.id,
                at: Utc::now(),
            });
        }
        if auto_delete {
            self.queues.remove(name);
            tracing::debug!(queue = name, "auto-deleted");
            self.events.emit(BrokerEvent::QueueDeleted {
                name: name.to_string(),
                at: Utc::now(),
            });
        }
        Ok(message)
    }

    /// Регистрирует консьюмера и запускает его цикл опроса.
    pub fn consume(
        &self,
        agent_id: impl Into<String>,
        name: &str,
        handler: ConsumeHandler,
        opts: ConsumeOptions,
    ) -> BrokerResult<ConsumerHandle> {
        let agent_id = agent_id.into();
        {
            let mut inner = self
                .queues
                .get_mut(name)
                .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
            if inner.config.exclusive && !inner.consumers.is_empty() {
                return Err(BrokerError::ExclusiveConsumer(name.to_string()));
            }
            inner.consumers.push(agent_id.clone());
        }
        let poll = opts.poll_interval.unwrap_or(self.default_poll);
        let auto_ack = opts.auto_ack;
        let manager = self.self_ref.clone();
        let queue = name.to_string();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll);
            loop {
                tick.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if manager.closed.load(Ordering::SeqCst) {
                    return;
                }
                let message = match manager.dequeue(&queue) {
                    Ok(Some(m)) => m,
                    Ok(None) => continue,
                    Err(_) => return, // очередь удалена
                };
                let id = message.id;
                // При выключенном auto_ack снятое сообщение числится
                // неподтверждённым, пока обработчик не отработает.
                if !auto_ack {
                    manager
                        .delivery
                        .register_pending(message.clone(), DeliveryGuarantee::at_least_once());
                }
                match handler(message.clone()) {
                    Ok(()) => {
                        if !auto_ack {
                            manager.delivery.acknowledge(id);
                        }
                    }
                    Err(err) => {
                        if !auto_ack {
                            manager.delivery.forget_pending(id);
                        }
                        manager.handle_consumer_error(&queue, message, &err);
                    }
                }
            }
        });
        Ok(ConsumerHandle {
            manager: self.self_ref.clone(),
            queue: name.to_string(),
            agent_id,
            task,
            active: AtomicBool::new(true),
        })
    }

    /// Ошибка обработчика: ограниченный возврат в очередь, затем
    /// dead-letter.
    fn handle_consumer_error(&self, queue: &str, mut message: Message, err: &BrokerError) {
        tracing::warn!(queue, id = %message.id, %err, "consumer handler failed");
        if message.metadata.retry_count < CONSUMER_REQUEUE_LIMIT {
            message.metadata.retry_count += 1;
            match self.queues.get_mut(queue) {
                Some(mut inner) => inner.insert(message),
                None => self
                    .delivery
                    .push_dead_letter(message, "queue removed during requeue"),
            }
        } else {
            self.delivery
                .push_dead_letter(message, format!("consumer handler failed: {err}"));
        }
    }

    fn remove_consumer(&self, queue: &str, agent_id: &str) {
        if let Some(mut inner) = self.queues.get_mut(queue) {
            if let Some(pos) = inner.consumers.iter().position(|c| c == agent_id) {
                inner.consumers.remove(pos);
            }
        }
    }

    pub fn stats(&self, name: &str) -> BrokerResult<QueueStats> {
        let inner = self
            .queues
            .get(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        Ok(QueueStats {
            name: name.to_string(),
            depth: inner.messages.len(),
            consumer_count: inner.consumers.len(),
            enqueued: inner.enqueued,
            dequeued: inner.dequeued,
            created: inner.created,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Гасит менеджер: циклы опроса консьюмеров видят флаг на
    /// ближайшем тике и завершаются, не снимая больше сообщений.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Capability отмены консьюмера: снимает цикл опроса и регистрацию.
/// Повторный вызов — no-op; `Drop` отменяет автоматически.
pub struct ConsumerHandle {
    manager: Weak<QueueManager>,
    queue: String,
    agent_id: String,
    task: JoinHandle<()>,
    active: AtomicBool,
}

impl ConsumerHandle {
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.task.abort();
            if let Some(manager) = self.manager.upgrade() {
                manager.remove_consumer(&self.queue, &self.agent_id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
