//! A metrics recorder that periodically logs all captured metrics.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A metrics recorder that logs counters and gauges through `tracing`.
pub struct LoggingRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl LoggingRecorder {
    /// Creates a new `LoggingRecorder` and starts a background task to log metrics.
    ///
    /// Counters whose name starts with `agg.` are logged as the change over
    /// the last interval and reset; all others are logged as running totals.
    ///
    /// # Arguments
    /// * `interval` - How often to log a snapshot.
    /// * `shutdown_rx` - Stops the background task when it changes or closes.
    pub fn new(interval: Duration, mut shutdown_rx: watch::Receiver<()>) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(Registry::new(AtomicStorage));
        let recorder = Self {
            registry: registry.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip the empty snapshot.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => log_snapshot(&registry, interval),
                    _ = shutdown_rx.changed() => {
                        log_snapshot(&registry, interval);
                        tracing::info!("Metrics logging task received shutdown signal.");
                        break;
                    }
                }
            }
        });

        (recorder, handle)
    }
}

#[cfg(test)]
impl LoggingRecorder {
    pub(crate) fn counter_value(&self, name: &'static str) -> u64 {
        self.registry
            .get_counter_handles()
            .get(&Key::from_name(name))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub(crate) fn gauge_value(&self, name: &'static str) -> f64 {
        self.registry
            .get_gauge_handles()
            .get(&Key::from_name(name))
            .map_or(0.0, |g| f64::from_bits(g.load(Ordering::Relaxed)))
    }
}

fn log_snapshot(registry: &Registry<Key, AtomicStorage>, interval: Duration) {
    tracing::debug!("--- Metrics Snapshot ---");
    for (key, counter) in registry.get_counter_handles() {
        if key.name().starts_with("agg.") {
            let value = counter.swap(0, Ordering::Relaxed);
            if value > 0 {
                tracing::info!("[Counter] {}: {} in the last {}s", key, value, interval.as_secs());
            }
        } else {
            tracing::info!("[Counter] {}: {}", key, counter.load(Ordering::Relaxed));
        }
    }
    for (key, gauge) in registry.get_gauge_handles() {
        let value = f64::from_bits(gauge.load(Ordering::Relaxed));
        tracing::info!("[Gauge] {}: {}", key, value);
    }
}

impl Recorder for LoggingRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |h| h.clone().into())
    }
}
