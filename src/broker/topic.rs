use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    events::{BrokerEvent, EventBus},
    Message,
};
use crate::{BrokerError, BrokerResult};

/// Обработчик сообщений темы; вызывается синхронно при fan-out.
pub type TopicHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Политика удержания истории темы.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Вся история без ограничений.
    All,
    /// Только последнее сообщение.
    Last,
    /// Сообщения не старше заданного окна.
    Time(Duration),
    /// Не больше заданного числа сообщений.
    Count(usize),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Count(100)
    }
}

/// Статистика темы для внешнего наблюдения.
#[derive(Debug, Clone)]
pub struct TopicStats {
    pub name: String,
    pub subscriber_count: usize,
    pub retained: usize,
    pub message_count: u64,
    pub created: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct Binding {
    token: u64,
    agent_id: String,
    handler: TopicHandler,
}

struct TopicInner {
    bindings: Vec<Binding>,
    replay: VecDeque<Message>,
    retention: RetentionPolicy,
    created: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
}

impl TopicInner {
    fn retain(&mut self, now: DateTime<Utc>) {
        match self.retention {
            RetentionPolicy::All => {}
            RetentionPolicy::Last => {
                while self.replay.len() > 1 {
                    self.replay.pop_front();
                }
            }
            RetentionPolicy::Count(limit) => {
                while self.replay.len() > limit {
                    self.replay.pop_front();
                }
            }
            RetentionPolicy::Time(window) => {
                let cutoff = now
                    - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
                while self
                    .replay
                    .front()
                    .is_some_and(|m| m.metadata.timestamp < cutoff)
                {
                    self.replay.pop_front();
                }
            }
        }
    }
}

/// Реестр широковещательных тем.
///
/// Темы создаются явно и не удаляются автоматически. Fan-out при
/// публикации переписывает `to` сообщения на текущий набор
/// подписчиков: присоединившиеся позже это сообщение не получат,
/// им доступна только история (`replay`).
pub struct TopicRegistry {
    topics: DashMap<String, TopicInner>,
    events: Arc<EventBus>,
    next_token: AtomicU64,
    // Слабая ссылка на себя для ручек подписки.
    self_ref: Weak<Self>,
}

impl TopicRegistry {
    pub fn new(events: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            topics: DashMap::new(),
            events,
            next_token: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn create(&self, name: &str, retention: Option<RetentionPolicy>) -> BrokerResult<()> {
        if self.topics.contains_key(name) {
            return Err(BrokerError::TopicExists(name.to_string()));
        }
        let now = Utc::now();
        self.topics.insert(
            name.to_string(),
            TopicInner {
                bindings: Vec::new(),
                replay: VecDeque::new(),
                retention: retention.unwrap_or_default(),
                created: now,
                last_activity: now,
                message_count: 0,
            },
        );
        tracing::debug!(topic = name, "topic created");
        self.events.emit(BrokerEvent::TopicCreated {
            name: name.to_string(),
            at: now,
        });
        Ok(())
    }

    pub fn subscribe(
        &self,
        agent_id: impl Into<String>,
        topic: &str,
        handler: TopicHandler,
    ) -> BrokerResult<TopicSubscription> {
        let agent_id = agent_id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
            inner.bindings.push(Binding {
                token,
                agent_id: agent_id.clone(),
                handler,
            });
        }
        self.events.emit(BrokerEvent::Subscribed {
            agent_id: agent_id.clone(),
            topic: topic.to_string(),
            at: Utc::now(),
        });
        Ok(TopicSubscription {
            registry: self.self_ref.clone(),
            topic: topic.to_string(),
            agent_id,
            token,
            active: AtomicBool::new(true),
        })
    }

    /// Публикация с fan-out на всех текущих подписчиков.
    /// Возвращает число вызванных обработчиков.
    pub fn publish(&self, topic: &str, mut message: Message) -> BrokerResult<usize> {
        let handlers: Vec<TopicHandler>;
        {
            let mut inner = self
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
            // `to` фиксируется на момент публикации.
            let mut recipients: Vec<String> = Vec::new();
            for b in &inner.bindings {
                if !recipients.contains(&b.agent_id) {
                    recipients.push(b.agent_id.clone());
                }
            }
            message.to = recipients;
            let now = Utc::now();
            inner.last_activity = now;
            inner.message_count += 1;
            inner.replay.push_back(message.clone());
            inner.retain(now);
            handlers = inner.bindings.iter().map(|b| b.handler.clone()).collect();
        }
        // Обработчики зовутся вне шарда DashMap: подписка из колбэка
        // не должна взаимоблокироваться с публикацией.
        for handler in &handlers {
            handler(&message);
        }
        self.events.emit(BrokerEvent::Published {
            message_id: message.id,
            subject: message.subject.clone(),
            at: Utc::now(),
        });
        Ok(handlers.len())
    }

    /// Удержанная история темы, от старых к новым.
    pub fn replay(&self, topic: &str) -> BrokerResult<Vec<Message>> {
        let inner = self
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        Ok(inner.replay.iter().cloned().collect())
    }

    pub fn stats(&self, topic: &str) -> BrokerResult<TopicStats> {
        let inner = self
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        let mut distinct: Vec<&str> = Vec::new();
        for b in &inner.bindings {
            if !distinct.contains(&b.agent_id.as_str()) {
                distinct.push(&b.agent_id);
            }
        }
        Ok(TopicStats {
            name: topic.to_string(),
            subscriber_count: distinct.len(),
            retained: inner.replay.len(),
            message_count: inner.message_count,
            created: inner.created,
            last_activity: inner.last_activity,
        })
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Снятие темы целиком; используется менеджером корреляции для
    /// приватных reply-тем.
    pub(crate) fn remove(&self, topic: &str) {
        self.topics.remove(topic);
    }

    fn unbind(&self, topic: &str, token: u64, agent_id: &str) {
        if let Some(mut inner) = self.topics.get_mut(topic) {
            inner.bindings.retain(|b| b.token != token);
        }
        self.events.emit(BrokerEvent::Unsubscribed {
            agent_id: agent_id.to_string(),
            topic: topic.to_string(),
            at: Utc::now(),
        });
    }
}

/// Capability отписки от темы.
///
/// Повторный вызов `unsubscribe` — no-op; `Drop` отписывает
/// автоматически, как и у подписок на каналы у брокеров-предков.
pub struct TopicSubscription {
    registry: Weak<TopicRegistry>,
    topic: String,
    agent_id: String,
    token: u64,
    active: AtomicBool,
}

impl TopicSubscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.unbind(&self.topic, self.token, &self.agent_id);
            }
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
