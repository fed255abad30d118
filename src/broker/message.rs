use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Разновидность сообщения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Notification,
    Broadcast,
}

/// Метаданные сообщения.
///
/// `retry_count` только растёт и никогда не превышает `max_retries`:
/// достигнув предела, сообщение уходит в dead-letter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    /// Приоритет: больше — срочнее.
    pub priority: i32,
    /// Время жизни в миллисекундах от `timestamp`.
    pub ttl_ms: Option<u64>,
    pub content_type: Option<String>,
    pub encoding: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            priority: 0,
            ttl_ms: None,
            content_type: None,
            encoding: None,
            retry_count: 0,
            max_retries: 3,
        }
    }
}

/// Единица транспорта брокера.
///
/// `id` неизменяем после создания; `subject` — ключ маршрутизации,
/// сегментированный точками (`sensor.room1.temp`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub from: String,
    /// Один получатель или упорядоченный набор; пусто для broadcast.
    pub to: Vec<String>,
    pub subject: String,
    pub payload: Bytes,
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: Vec::new(),
            subject: subject.into(),
            payload: payload.into(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Событие без адресата — базовый вариант для `publish`.
    pub fn event(
        from: impl Into<String>,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(MessageKind::Event, from, subject, payload)
    }

    pub fn with_to(mut self, to: Vec<String>) -> Self {
        self.to = to;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.metadata.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid, reply_to: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self.metadata.reply_to = Some(reply_to.into());
        self
    }

    /// Истёк ли TTL относительно `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.metadata.timestamp);
                age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 >= ttl
            }
            None => false,
        }
    }
}

/// Тип гарантии доставки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuaranteeKind {
    AtMostOnce,
    AtLeastOnce,
    /// Заявлена, но подавление дубликатов — внешний хук (см.
    /// [`crate::broker::delivery::DuplicateCheck`]), по умолчанию заглушка.
    ExactlyOnce,
}

/// Политика повторов с экспоненциальной задержкой.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Задержка перед повтором номер `retry_count`:
    /// `min(multiplier^retry_count * 1s, max_backoff)`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let base = self.backoff_multiplier.powi(retry_count as i32) * 1000.0;
        Duration::from_millis(base as u64).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Гарантия доставки, передаётся per-call или берётся по умолчанию.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryGuarantee {
    pub kind: GuaranteeKind,
    pub ack_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DeliveryGuarantee {
    fn default() -> Self {
        Self {
            kind: GuaranteeKind::AtLeastOnce,
            ack_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl DeliveryGuarantee {
    pub fn at_most_once() -> Self {
        Self {
            kind: GuaranteeKind::AtMostOnce,
            ..Self::default()
        }
    }

    pub fn at_least_once() -> Self {
        Self::default()
    }

    pub fn exactly_once() -> Self {
        Self {
            kind: GuaranteeKind::ExactlyOnce,
            ..Self::default()
        }
    }
}
