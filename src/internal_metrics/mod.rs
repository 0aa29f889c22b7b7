//! # Internal Metrics Module
//!
//! Counters and gauges describing the dispatch pipeline, recorded through
//! the `metrics` facade. Without an installed recorder every handle is a
//! no-op; `main` installs a [`logging_recorder::LoggingRecorder`] when
//! `metrics.log_metrics` is enabled.

pub mod logging_recorder;

use metrics::{Counter, Gauge, Unit};

/// Cloneable handles to the dispatcher's metrics.
#[derive(Clone)]
pub struct Metrics {
    pub messages_popped_total: Counter,
    /// Reset by the logging recorder after every snapshot.
    pub deliveries_completed: Counter,
    pub deliveries_in_flight: Gauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Registers descriptions with the global recorder and creates handles.
    pub fn new() -> Self {
        metrics::describe_counter!("messages_popped_total", Unit::Count, "Total number of messages popped from the queue.");
        metrics::describe_counter!("queue_decode_failures_total", Unit::Count, "Total number of queue items that could not be decoded.");
        metrics::describe_counter!("render_failures_total", Unit::Count, "Total number of messages rendered as fallback error text.");
        metrics::describe_counter!("agg.deliveries_completed", Unit::Count, "Deliveries finished, successful or not, since the last snapshot.");
        metrics::describe_counter!("deliveries_total", Unit::Count, "Total number of delivery attempts, labeled by provider and outcome.");
        metrics::describe_gauge!("deliveries_in_flight", Unit::Count, "The number of deliveries currently holding an admission slot.");

        Self {
            messages_popped_total: metrics::counter!("messages_popped_total"),
            deliveries_completed: metrics::counter!("agg.deliveries_completed"),
            deliveries_in_flight: metrics::gauge!("deliveries_in_flight"),
        }
    }

    /// Counts one delivery attempt.
    pub fn record_delivery(&self, provider: &str, outcome: &'static str) {
        metrics::counter!(
            "deliveries_total",
            "provider" => provider.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}
