use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Настройки брокера.
///
/// Загружаются из значений по умолчанию с переопределением через
/// переменные окружения с префиксом `KURIER_` (например
/// `KURIER_MAX_QUEUE_SIZE=500`). Все интервалы заданы в миллисекундах.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Максимальный размер payload в байтах; больше — `PayloadTooLarge`.
    pub max_message_size: usize,
    /// Ёмкость очереди по умолчанию, если не задана в `QueueConfig`.
    pub max_queue_size: usize,
    /// Ограничение брокерного dead-letter списка (старые вытесняются).
    pub dead_letter_limit: usize,
    /// Порог размера пакета, при достижении — немедленный flush.
    pub batch_max_size: usize,
    /// Временное окно пакетирования.
    pub batch_window_ms: u64,
    /// Интервал опроса очереди консьюмером.
    pub consume_poll_ms: u64,
    /// Интервал фонового обхода неподтверждённых доставок.
    pub ack_sweep_interval_ms: u64,
    /// Возраст pending-ack, после которого доставка считается зависшей.
    pub ack_staleness_ms: u64,
    /// Интервал пересчёта throughput в метриках.
    pub throughput_tick_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            max_queue_size: 1000,
            dead_letter_limit: 1024,
            batch_max_size: 100,
            batch_window_ms: 50,
            consume_poll_ms: 100,
            ack_sweep_interval_ms: 5_000,
            ack_staleness_ms: 30_000,
            throughput_tick_ms: 1_000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let cfg = Config::builder()
            // Добавляем значения по умолчанию
            .set_default("max_message_size", defaults.max_message_size as u64)?
            .set_default("max_queue_size", defaults.max_queue_size as u64)?
            .set_default("dead_letter_limit", defaults.dead_letter_limit as u64)?
            .set_default("batch_max_size", defaults.batch_max_size as u64)?
            .set_default("batch_window_ms", defaults.batch_window_ms)?
            .set_default("consume_poll_ms", defaults.consume_poll_ms)?
            .set_default("ack_sweep_interval_ms", defaults.ack_sweep_interval_ms)?
            .set_default("ack_staleness_ms", defaults.ack_staleness_ms)?
            .set_default("throughput_tick_ms", defaults.throughput_tick_ms)?
            // Добавляем переменные окружения с префиксом KURIER_
            .add_source(Environment::with_prefix("KURIER"))
            .build()?;

        // Десериализуем конфигурацию в нашу структуру
        cfg.try_deserialize()
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn consume_poll(&self) -> Duration {
        Duration::from_millis(self.consume_poll_ms)
    }

    pub fn ack_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ack_sweep_interval_ms)
    }

    pub fn ack_staleness(&self) -> Duration {
        Duration::from_millis(self.ack_staleness_ms)
    }

    pub fn throughput_tick(&self) -> Duration {
        Duration::from_millis(self.throughput_tick_ms)
    }
}
