//! Подсистема брокера сообщений.
//!
//! Этот модуль реализует внутрипроцессный брокер: широковещательные
//! темы, именованные очереди, маршрутизацию по шаблонам, гарантии
//! доставки и корреляцию запрос/ответ:
//!
//! - `batch`: пакетирование публикаций по размеру и временному окну.
//! - `core`: фасад `Broker` — публичная поверхность операций.
//! - `correlation`: запрос/ответ через приватные reply-темы.
//! - `delivery`: гарантии, повторы, подтверждения, dead-letter.
//! - `events`: синхронная шина жизненного цикла брокера.
//! - `intern` (приватный): интернирование subject-строк.
//! - `message`: структура сообщений, метаданные, политики повторов.
//! - `metrics`: счётчики, EMA-латентность, throughput.
//! - `pattern`: язык шаблонов subject (`*`, `#`) и роутер.
//! - `queue`: point-to-point очереди с консьюмерами и DLQ.
//! - `topic`: темы с fan-out, историей и политиками удержания.
//!
//! Публичный API переэкспортирует основные типы каждого модуля.

pub mod batch;
pub mod core;
pub mod correlation;
pub mod delivery;
pub mod events;
mod intern;
pub mod message;
pub mod metrics;
pub mod pattern;
pub mod queue;
pub mod topic;

pub use batch::BatchProcessor;
pub use self::core::{Broker, IdentityCodec, PayloadCodec};
pub use correlation::CorrelationManager;
pub use delivery::{DeliveryEngine, DuplicateCheck, NoDedup, PendingAck};
pub use events::{BrokerEvent, EventBus, EventListener};
pub(crate) use intern::intern_subject;
pub use message::{
    DeliveryGuarantee, GuaranteeKind, Message, MessageKind, MessageMetadata, RetryPolicy,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pattern::{PatternHandler, PatternRouter, SubjectPattern};
pub use queue::{
    ConsumeHandler, ConsumeOptions, ConsumerHandle, QueueConfig, QueueManager, QueueStats,
};
pub use topic::{
    RetentionPolicy, TopicHandler, TopicRegistry, TopicStats, TopicSubscription,
};
