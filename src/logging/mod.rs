use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Конфигурация логирования брокера.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Базовый уровень; переопределяется переменной `KURIER_LOG`.
    pub level: String,
    /// Цветной вывод в консоль.
    pub ansi: bool,
    /// Показывать target событий.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            with_target: true,
        }
    }
}

/// Инициализация логирования с конфигурацией.
///
/// Повторный вызов в одном процессе вернёт ошибку: глобальный
/// subscriber устанавливается один раз.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_env("KURIER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi)
        .with_target(config.with_target);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        "logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет значения конфигурации по умолчанию.
    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.ansi);
        assert!(config.with_target);
    }
}
