//! Shared fakes for the integration tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telegram_sender::core::{Event, EventKind, Message, ProviderClient, Renderer};
use telegram_sender::notification::{DeliveryError, ProviderKind};

/// A provider client that records every delivery it is asked to make.
pub struct MockProvider {
    kind: ProviderKind,
    fail_targets: Vec<String>,
    delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Self::build(kind, Vec::new(), Duration::ZERO)
    }

    /// Fails deliveries to any of `targets`.
    pub fn failing_for(kind: ProviderKind, targets: &[&str]) -> Arc<Self> {
        Self::build(
            kind,
            targets.iter().map(|t| t.to_string()).collect(),
            Duration::ZERO,
        )
    }

    pub fn slow(kind: ProviderKind, delay: Duration) -> Arc<Self> {
        Self::build(kind, Vec::new(), delay)
    }

    fn build(kind: ProviderKind, fail_targets: Vec<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail_targets,
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
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
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_targets.iter().any(|t| t == target) {
            return Err(DeliveryError::Provider {
                code: 40001,
                message: "invalid target".to_string(),
            });
        }
        Ok(())
    }
}

/// Renders `<hash id>:<sname>` and counts calls.
#[derive(Default)]
pub struct CountingRenderer {
    calls: AtomicUsize,
}

impl CountingRenderer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Renderer for CountingRenderer {
    fn render(&self, message: &Message) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{}:{}", message.hash_id(), message.event.name)
    }
}

/// An alert message addressed to `tos`.
pub fn alert(hash_id: u64, tos: &[&str]) -> Message {
    Message {
        event: Event {
            hash_id,
            kind: EventKind::Alert,
            priority: 1,
            name: format!("rule-{}", hash_id),
            occurred_at: 1_700_000_000,
            ..Default::default()
        },
        readable_endpoint: "host-01".to_string(),
        metrics: vec!["cpu.idle".to_string()],
        readable_tags: "region=east".to_string(),
        tos: tos.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}
