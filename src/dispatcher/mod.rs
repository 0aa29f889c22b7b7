//! The dispatch engine.
//!
//! One sequential loop pops messages, renders each once, and fans the text
//! out to every recipient. Each recipient's delivery runs as its own task,
//! admitted through an [`AdmissionPool`] slot that the task holds until it
//! ends. The loop never waits for deliveries to finish; it only waits for a
//! free slot, which is the sole backpressure on the queue.

pub mod admission;

pub use admission::AdmissionPool;

use crate::config::ConsumerConfig;
use crate::core::{Message, QueueSource, Renderer};
use crate::internal_metrics::Metrics;
use crate::notification::{ProviderSet, RecipientAddress};
use metrics::Gauge;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Queue-facing settings of the consumption loop.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue: String,
    pub batch_size: usize,
    pub idle_backoff: Duration,
}

impl From<&ConsumerConfig> for DispatchSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            batch_size: config.batch_size.max(1),
            idle_backoff: Duration::from_millis(config.idle_backoff_ms),
        }
    }
}

/// Totals for one run of the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub messages: usize,
    pub scheduled: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Deliveries whose task panicked. Also counted in `failed`.
    pub panicked: usize,
}

#[derive(Debug, Default)]
struct Tally {
    messages: AtomicUsize,
    scheduled: AtomicUsize,
    delivered: AtomicUsize,
    failed: AtomicUsize,
    panicked: AtomicUsize,
}

impl Tally {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self) -> DispatchReport {
        DispatchReport {
            messages: self.messages.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

/// When the consumption loop stops.
enum StopWhen {
    Shutdown(watch::Receiver<()>),
    QueueEmpty,
}

impl StopWhen {
    /// True once shutdown has been signalled or the sender is gone.
    fn requested(&self) -> bool {
        match self {
            StopWhen::Shutdown(rx) => rx.has_changed().unwrap_or(true),
            StopWhen::QueueEmpty => false,
        }
    }
}

/// Drains a queue and delivers each message to its recipients.
pub struct Dispatcher {
    queue: Arc<dyn QueueSource>,
    renderer: Arc<dyn Renderer>,
    providers: Arc<ProviderSet>,
    pool: AdmissionPool,
    settings: DispatchSettings,
    metrics: Metrics,
    tally: Arc<Tally>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueSource>,
        renderer: Arc<dyn Renderer>,
        providers: ProviderSet,
        pool: AdmissionPool,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            renderer,
            providers: Arc::new(providers),
            pool,
            settings,
            metrics: Metrics::new(),
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pool(&self) -> &AdmissionPool {
        &self.pool
    }

    /// Consumes the queue until `shutdown_rx` fires, then waits for every
    /// in-flight delivery.
    pub async fn run(self, shutdown_rx: watch::Receiver<()>) -> DispatchReport {
        self.consume(StopWhen::Shutdown(shutdown_rx)).await
    }

    /// Consumes until the first empty (or failed) pop, then waits for every
    /// in-flight delivery.
    pub async fn run_until_empty(self) -> DispatchReport {
        self.consume(StopWhen::QueueEmpty).await
    }

    async fn consume(self, mut stop: StopWhen) -> DispatchReport {
        let mut units: JoinSet<()> = JoinSet::new();
        info!(
            queue = %self.settings.queue,
            workers = self.pool.capacity(),
            batch_size = self.settings.batch_size,
            "Dispatcher started"
        );

        loop {
            self.reap(&mut units);
            if stop.requested() {
                info!("Dispatcher received shutdown signal.");
                break;
            }

            // A pop is never cancelled: items it removed would be lost.
            let messages = match self
                .queue
                .pop(self.settings.batch_size, &self.settings.queue)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(queue = %self.settings.queue, error = %e, "Failed to pop from queue");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                match &mut stop {
                    StopWhen::QueueEmpty => break,
                    StopWhen::Shutdown(rx) => {
                        tokio::select! {
                            biased;
                            _ = rx.changed() => {
                                info!("Dispatcher received shutdown signal while idle.");
                                break;
                            }
                            _ = tokio::time::sleep(self.settings.idle_backoff) => continue,
                        }
                    }
                }
            }

            for message in messages {
                self.dispatch(message, &mut units).await;
            }
        }

        info!(in_flight = units.len(), "Waiting for in-flight deliveries");
        while let Some(result) = units.join_next().await {
            self.note_join(result);
        }

        let report = self.tally.report();
        info!(?report, "Dispatcher finished");
        report
    }

    /// Renders `message` once and schedules one delivery per recipient.
    async fn dispatch(&self, message: Message, units: &mut JoinSet<()>) {
        let hash_id = message.hash_id();
        self.metrics.messages_popped_total.increment(1);
        Tally::bump(&self.tally.messages);

        info!(hash_id, "hashid start");
        info!(
            hash_id,
            endpoint = %message.readable_endpoint,
            metrics = %message.metrics.join(","),
            tags = %message.readable_tags,
            recipients = message.tos.len(),
            "Dispatching message"
        );

        if !message.tos.is_empty() {
            let text: Arc<str> = Arc::from(self.renderer.render(&message));
            for recipient in message.tos {
                let slot = self.pool.acquire().await;
                Tally::bump(&self.tally.scheduled);

                let providers = self.providers.clone();
                let metrics = self.metrics.clone();
                let tally = self.tally.clone();
                let text = text.clone();
                units.spawn(async move {
                    let _slot = slot;
                    let _in_flight = InFlight::enter(&metrics);
                    match providers.deliver(&recipient, &text).await {
                        Ok(kind) => {
                            debug!(hash_id, recipient = %recipient, "Delivered");
                            metrics.record_delivery(kind.tag(), "success");
                            Tally::bump(&tally.delivered);
                        }
                        Err(e) => {
                            error!(hash_id, recipient = %recipient, error = %e, "send to {} fail", recipient);
                            let provider = recipient
                                .parse::<RecipientAddress>()
                                .map_or("invalid", |r| r.kind.tag());
                            metrics.record_delivery(provider, e.kind());
                            Tally::bump(&tally.failed);
                        }
                    }
                    metrics.deliveries_completed.increment(1);
                });
            }
        }

        info!(hash_id, "hashid end");
    }

    /// Collects delivery tasks that have already finished.
    fn reap(&self, units: &mut JoinSet<()>) {
        while let Some(result) = units.try_join_next() {
            self.note_join(result);
        }
    }

    fn note_join(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            error!(error = %e, "Delivery task panicked");
            Tally::bump(&self.tally.panicked);
            Tally::bump(&self.tally.failed);
        }
    }
}

/// Holds one unit of the `deliveries_in_flight` gauge until dropped,
/// including when the delivery task unwinds.
struct InFlight(Gauge);

impl InFlight {
    fn enter(metrics: &Metrics) -> Self {
        metrics.deliveries_in_flight.increment(1.0);
        Self(metrics.deliveries_in_flight.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Event, ProviderClient};
    use crate::internal_metrics::logging_recorder::LoggingRecorder;
    use crate::notification::{DeliveryError, ProviderKind};
    use crate::queue::{MemoryQueue, QueueError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CountingRenderer {
        calls: AtomicUsize,
    }

    impl CountingRenderer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Renderer for CountingRenderer {
        fn render(&self, message: &Message) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("rendered #{}", message.hash_id())
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct MockProvider {
        kind: ProviderKind,
        behaviour: Behaviour,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        received: Mutex<Vec<(String, String)>>,
    }

    impl MockProvider {
        fn new(kind: ProviderKind, behaviour: Behaviour) -> Arc<Self> {
            Self::with_delay(kind, behaviour, Duration::ZERO)
        }

        fn with_delay(kind: ProviderKind, behaviour: Behaviour, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behaviour,
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<(String, String)> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn deliver(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.received
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(DeliveryError::Provider {
                    code: 500,
                    message: "boom".to_string(),
                }),
                Behaviour::Panic => panic!("provider crashed"),
            }
        }
    }

    struct BrokenQueue {
        pops: AtomicUsize,
    }

    #[async_trait]
    impl QueueSource for BrokenQueue {
        async fn pop(&self, _count: usize, _queue: &str) -> Result<Vec<Message>, QueueError> {
            self.pops.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Timeout(500))
        }
    }

    fn message(hash_id: u64, tos: &[&str]) -> Message {
        Message {
            event: Event {
                hash_id,
                ..Default::default()
            },
            tos: tos.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn settings(batch_size: usize) -> DispatchSettings {
        DispatchSettings {
            queue: "test-queue".to_string(),
            batch_size,
            idle_backoff: Duration::from_millis(300),
        }
    }

    fn dispatcher(
        queue: Arc<dyn QueueSource>,
        renderer: Arc<dyn Renderer>,
        providers: ProviderSet,
        workers: usize,
    ) -> Dispatcher {
        Dispatcher::new(queue, renderer, providers, AdmissionPool::new(workers), settings(1))
    }

    #[tokio::test]
    async fn test_message_without_recipients_schedules_nothing() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(1, &[]));
        let renderer = CountingRenderer::new();
        let telegram = MockProvider::new(ProviderKind::Telegram, Behaviour::Succeed);

        let report = dispatcher(
            queue,
            renderer.clone(),
            ProviderSet::new().with(telegram.clone()),
            4,
        )
        .run_until_empty()
        .await;

        assert_eq!(report.messages, 1);
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.failed, 0);
        assert!(telegram.received().is_empty());
    }

    #[tokio::test]
    async fn test_failing_provider_does_not_block_sibling_recipient() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(7, &["tg|123", "mango|roomA"]));
        let telegram = MockProvider::new(ProviderKind::Telegram, Behaviour::Fail);
        let gateway = MockProvider::new(ProviderKind::Gateway, Behaviour::Succeed);
        let providers = ProviderSet::new()
            .with(telegram.clone())
            .with(gateway.clone());

        let report = dispatcher(queue, CountingRenderer::new(), providers, 4)
            .run_until_empty()
            .await;

        assert_eq!(report.scheduled, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(telegram.received(), vec![("123".to_string(), "rendered #7".to_string())]);
        assert_eq!(gateway.received(), vec![("roomA".to_string(), "rendered #7".to_string())]);
    }

    #[tokio::test]
    async fn test_renders_once_per_message() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(1, &["tg|a", "tg|b", "tg|c"]));
        queue.push(&message(2, &["tg|d", "tg|e"]));
        let renderer = CountingRenderer::new();
        let telegram = MockProvider::new(ProviderKind::Telegram, Behaviour::Succeed);

        let report = dispatcher(
            queue,
            renderer.clone(),
            ProviderSet::new().with(telegram.clone()),
            8,
        )
        .run_until_empty()
        .await;

        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.delivered, 5);
        let texts: Vec<String> = telegram
            .received()
            .into_iter()
            .filter(|(target, _)| ["a", "b", "c"].contains(&target.as_str()))
            .map(|(_, text)| text)
            .collect();
        assert_eq!(texts, vec!["rendered #1"; 3]);
    }

    #[tokio::test]
    async fn test_in_flight_deliveries_never_exceed_worker_count() {
        let workers = 2;
        let queue = Arc::new(MemoryQueue::new());
        let tos: Vec<String> = (0..10).map(|i| format!("tg|{}", i)).collect();
        let tos: Vec<&str> = tos.iter().map(String::as_str).collect();
        queue.push(&message(1, &tos));
        queue.push(&message(2, &tos));
        let telegram = MockProvider::with_delay(
            ProviderKind::Telegram,
            Behaviour::Succeed,
            Duration::from_millis(10),
        );

        let dispatcher = dispatcher(
            queue,
            CountingRenderer::new(),
            ProviderSet::new().with(telegram.clone()),
            workers,
        );
        let pool = dispatcher.pool().clone();
        let report = dispatcher.run_until_empty().await;

        assert_eq!(report.delivered, 20);
        assert!(telegram.peak.load(Ordering::SeqCst) <= workers);
        assert_eq!(pool.available(), workers, "every slot is returned");
    }

    #[tokio::test]
    async fn test_panicking_delivery_releases_its_slot() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(3, &["tg|1", "mango|roomA"]));
        let providers = ProviderSet::new()
            .with(MockProvider::new(ProviderKind::Telegram, Behaviour::Panic))
            .with(MockProvider::new(ProviderKind::Gateway, Behaviour::Succeed));

        let dispatcher = dispatcher(queue, CountingRenderer::new(), providers, 1);
        let pool = dispatcher.pool().clone();
        let report = dispatcher.run_until_empty().await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.panicked, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_panicking_delivery_leaves_no_delivery_in_flight() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let (recorder, _logger) = LoggingRecorder::new(Duration::from_secs(3600), shutdown_rx);
        let metrics = metrics::with_local_recorder(&recorder, Metrics::new);
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(6, &["tg|1", "tg|2", "mango|roomA"]));
        let providers = ProviderSet::new()
            .with(MockProvider::new(ProviderKind::Telegram, Behaviour::Panic))
            .with(MockProvider::new(ProviderKind::Gateway, Behaviour::Succeed));

        let report = dispatcher(queue, CountingRenderer::new(), providers, 2)
            .with_metrics(metrics)
            .run_until_empty()
            .await;

        assert_eq!(report.panicked, 2);
        assert_eq!(recorder.gauge_value("deliveries_in_flight"), 0.0);
    }

    #[tokio::test]
    async fn test_completed_deliveries_feed_the_aggregated_counter() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let (recorder, _logger) = LoggingRecorder::new(Duration::from_secs(3600), shutdown_rx);
        let metrics = metrics::with_local_recorder(&recorder, Metrics::new);
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(8, &["tg|1", "mango|roomA", "sms|555"]));
        let providers = ProviderSet::new()
            .with(MockProvider::new(ProviderKind::Telegram, Behaviour::Succeed))
            .with(MockProvider::new(ProviderKind::Gateway, Behaviour::Fail));

        let report = dispatcher(queue, CountingRenderer::new(), providers, 2)
            .with_metrics(metrics)
            .run_until_empty()
            .await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(recorder.counter_value("agg.deliveries_completed"), 3);
        assert_eq!(recorder.counter_value("messages_popped_total"), 1);
    }

    #[tokio::test]
    async fn test_unknown_discriminator_fails_only_that_recipient() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(4, &["sms|555", "tg|1", "no-separator"]));
        let telegram = MockProvider::new(ProviderKind::Telegram, Behaviour::Succeed);

        let report = dispatcher(
            queue,
            CountingRenderer::new(),
            ProviderSet::new().with(telegram.clone()),
            2,
        )
        .run_until_empty()
        .await;

        assert_eq!(report.scheduled, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(telegram.received().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_item_does_not_discard_batch() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(1, &["tg|1"]));
        queue.push_raw("{ definitely not a message");
        queue.push(&message(2, &["tg|2"]));
        let telegram = MockProvider::new(ProviderKind::Telegram, Behaviour::Succeed);

        let report = Dispatcher::new(
            queue,
            CountingRenderer::new(),
            ProviderSet::new().with(telegram.clone()),
            AdmissionPool::new(2),
            settings(3),
        )
        .run_until_empty()
        .await;

        assert_eq!(report.messages, 2);
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_queue_is_polled_with_backoff() {
        let queue = Arc::new(MemoryQueue::new());
        let renderer = CountingRenderer::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(
            dispatcher(queue.clone(), renderer.clone(), ProviderSet::new(), 1).run(shutdown_rx),
        );

        // Polls at 0, 300, 600 and 900ms.
        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(queue.pop_count(), 4);

        shutdown_tx.send(()).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_errors_are_treated_as_idle() {
        let queue = Arc::new(BrokenQueue {
            pops: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(
            dispatcher(queue.clone(), CountingRenderer::new(), ProviderSet::new(), 1)
                .run(shutdown_rx),
        );

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(queue.pops.load(Ordering::SeqCst), 3);

        shutdown_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_deliveries() {
        let queue = Arc::new(MemoryQueue::new());
        queue.push(&message(5, &["tg|1", "tg|2"]));
        let telegram = MockProvider::with_delay(
            ProviderKind::Telegram,
            Behaviour::Succeed,
            Duration::from_millis(50),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = tokio::spawn(
            dispatcher(
                queue.clone(),
                CountingRenderer::new(),
                ProviderSet::new().with(telegram.clone()),
                2,
            )
            .run(shutdown_rx),
        );

        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.delivered, 2);
    }
}
