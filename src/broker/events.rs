use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

/// Событие наблюдаемости брокера.
///
/// Излучается на каждом значимом переходе состояния и предназначено
/// для внешних логов и метрик; сам брокер на события не подписан.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    TopicCreated { name: String, at: DateTime<Utc> },
    QueueCreated { name: String, at: DateTime<Utc> },
    QueueDeleted { name: String, at: DateTime<Utc> },
    PatternRegistered { pattern: String, agent_id: String, at: DateTime<Utc> },
    Subscribed { agent_id: String, topic: String, at: DateTime<Utc> },
    Unsubscribed { agent_id: String, topic: String, at: DateTime<Utc> },
    Published { message_id: Uuid, subject: String, at: DateTime<Utc> },
    Enqueued { queue: String, message_id: Uuid, at: DateTime<Utc> },
    Dequeued { queue: String, message_id: Uuid, at: DateTime<Utc> },
    Delivered { message_id: Uuid, agent_id: String, at: DateTime<Utc> },
    DeliveryFailed { message_id: Uuid, agent_id: String, reason: String, at: DateTime<Utc> },
    Acknowledged { message_id: Uuid, at: DateTime<Utc> },
    DeadLettered { message_id: Uuid, reason: String, at: DateTime<Utc> },
    Shutdown { at: DateTime<Utc> },
}

pub type EventListener = Arc<dyn Fn(&BrokerEvent) + Send + Sync>;

/// Реестр слушателей событий.
///
/// Рассылка синхронная, всем текущим слушателям, без буферизации:
/// слушатель обязан быть быстрым и не блокировать вызывающий поток.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, listener: EventListener) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: BrokerEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}
