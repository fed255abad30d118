use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Коэффициент сглаживания EMA задержки доставки.
const EMA_ALPHA: f64 = 0.2;

/// Моментальный снимок метрик брокера.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Экспоненциально сглаженная задержка доставки, мс.
    pub average_latency_ms: f64,
    /// Доставлено в секунду за последний тик.
    pub throughput_per_sec: f64,
}

/// Пассивный сборщик метрик: компоненты пишут счётчики, фоновый тик
/// пересчитывает throughput по дельте доставленных.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    /// f64 в битах: среднее время доставки, мс.
    latency_ema: AtomicU64,
    /// f64 в битах: доставлено в секунду.
    throughput: AtomicU64,
    /// Значение `delivered` на момент прошлого тика.
    delivered_at_tick: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, latency: Duration) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let sample = latency.as_secs_f64() * 1000.0;
        // CAS-цикл: EMA обновляется редко конкурентно, конфликтов мало.
        let mut current = self.latency_ema.load(Ordering::Relaxed);
        loop {
            let old = f64::from_bits(current);
            let new = if self.delivered.load(Ordering::Relaxed) == 1 {
                sample
            } else {
                old + EMA_ALPHA * (sample - old)
            };
            match self.latency_ema.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Пересчёт throughput; вызывается фоновой задачей с фиксированным
    /// интервалом `elapsed`.
    pub fn tick(&self, elapsed: Duration) {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let previous = self.delivered_at_tick.swap(delivered, Ordering::Relaxed);
        let delta = delivered.saturating_sub(previous) as f64;
        let per_sec = if elapsed.is_zero() {
            0.0
        } else {
            delta / elapsed.as_secs_f64()
        };
        self.throughput.store(per_sec.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            average_latency_ms: f64::from_bits(self.latency_ema.load(Ordering::Relaxed)),
            throughput_per_sec: f64::from_bits(self.throughput.load(Ordering::Relaxed)),
        }
    }
}
