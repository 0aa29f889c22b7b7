//! The main application logic, decoupled from the entry point.

use crate::{
    config::Config,
    core::{QueueSource, Renderer},
    dispatcher::{AdmissionPool, DispatchReport, DispatchSettings, Dispatcher},
    formatting::TemplateRenderer,
    internal_metrics::Metrics,
    notification::{http::build_client, GatewayClient, ProviderSet, TelegramClient},
    queue::RedisQueue,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// A handle to the running dispatcher.
pub struct App {
    dispatcher: JoinHandle<DispatchReport>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// Waits for the dispatcher to observe shutdown and finish its in-flight
    /// deliveries.
    pub async fn run(self) -> Result<DispatchReport> {
        let report = self
            .dispatcher
            .await
            .context("Dispatcher task panicked")?;
        info!(?report, "All tasks shut down.");
        Ok(report)
    }
}

/// Builder for the main application.
///
/// Every collaborator of the dispatcher can be overridden, which is how the
/// integration tests run without Redis or live chat endpoints.
pub struct AppBuilder {
    config: Config,
    queue_override: Option<Arc<dyn QueueSource>>,
    renderer_override: Option<Arc<dyn Renderer>>,
    providers_override: Option<ProviderSet>,
    metrics_override: Option<Metrics>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            queue_override: None,
            renderer_override: None,
            providers_override: None,
            metrics_override: None,
        }
    }

    /// Overrides the Redis queue, e.g. with a `MemoryQueue`.
    pub fn queue_override(mut self, queue: Arc<dyn QueueSource>) -> Self {
        self.queue_override = Some(queue);
        self
    }

    /// Overrides the template renderer.
    pub fn renderer_override(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer_override = Some(renderer);
        self
    }

    /// Overrides the provider clients built from configuration.
    pub fn providers_override(mut self, providers: ProviderSet) -> Self {
        self.providers_override = Some(providers);
        self
    }

    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Wires the dispatcher without starting it.
    #[instrument(skip_all)]
    pub fn build_dispatcher(self) -> Result<Dispatcher> {
        let config = self.config;

        let queue: Arc<dyn QueueSource> = match self.queue_override {
            Some(queue) => queue,
            None => Arc::new(
                RedisQueue::new(&config.redis).context("Failed to create Redis queue client")?,
            ),
        };
        let renderer: Arc<dyn Renderer> = match self.renderer_override {
            Some(renderer) => renderer,
            None => Arc::new(TemplateRenderer::from_path(&config.template.path)),
        };
        let providers = match self.providers_override {
            Some(providers) => providers,
            None => build_providers(&config)?,
        };
        if providers.is_empty() {
            warn!("No provider is configured; every delivery will fail.");
        }

        let dispatcher = Dispatcher::new(
            queue,
            renderer,
            providers,
            AdmissionPool::new(config.consumer.worker),
            DispatchSettings::from(&config.consumer),
        );
        Ok(match self.metrics_override {
            Some(metrics) => dispatcher.with_metrics(metrics),
            None => dispatcher,
        })
    }

    /// Builds the dispatcher and starts it on its own task.
    pub fn build(self, shutdown_rx: watch::Receiver<()>) -> Result<App> {
        let dispatcher = self.build_dispatcher()?;
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));
        Ok(App { dispatcher: handle })
    }
}

/// Creates one client per provider that has a token configured, all sharing
/// a single HTTP transport.
pub fn build_providers(config: &Config) -> Result<ProviderSet> {
    let http = build_client(&config.http)?;
    let mut providers = ProviderSet::new();
    if !config.telegram.token.is_empty() {
        providers = providers.with(Arc::new(TelegramClient::new(http.clone(), &config.telegram)));
        info!(base_url = %config.telegram.base_url, "Telegram provider enabled");
    }
    if !config.gateway.token.is_empty() {
        providers = providers.with(Arc::new(GatewayClient::new(http, &config.gateway)));
        info!(base_url = %config.gateway.base_url, "Gateway provider enabled");
    }
    Ok(providers)
}
