//! telegram-sender - delivers queued alert events to chat providers.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use telegram_sender::{
    app::{build_providers, App},
    cli::{Cli, Command},
    config::Config,
    internal_metrics::logging_recorder::LoggingRecorder,
    logging::init_logging,
};
use tokio::sync::watch;
use tracing::{error, info};

const TEST_MESSAGE: &str = "test message from telegram-sender";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load_from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    let log_guard = match init_logging(&config.log) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    };

    match cli.command() {
        Command::Test { recipients } => {
            if !run_test(&config, &recipients).await? {
                drop(log_guard);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Drain => {
            let report = App::builder(config).build_dispatcher()?.run_until_empty().await;
            info!(?report, "Queue drained.");
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("telegram-sender starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log.level);
    info!("Queue: {}", config.consumer.queue);
    info!("Workers: {}", config.consumer.worker);
    info!("Batch Size: {}", config.consumer.batch_size);
    info!("Redis: {} (db {})", config.redis.addr, config.redis.db);
    info!("Template: {}", config.template.path.display());
    info!("-------------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let metrics_task = if config.metrics.log_metrics {
        info!(
            "Logging recorder enabled. Metrics will be printed every {} seconds.",
            config.metrics.log_aggregation_seconds
        );
        let (recorder, handle) = LoggingRecorder::new(
            Duration::from_secs(config.metrics.log_aggregation_seconds.max(1)),
            shutdown_rx.clone(),
        );
        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("Failed to install logging recorder: {}", e))?;
        Some(handle)
    } else {
        None
    };

    let app = App::builder(config).build(shutdown_rx)?;

    shutdown_signal().await?;
    info!("Shutdown signal received. Shutting down gracefully...");
    // Receivers may already be gone if the dispatcher exited.
    let _ = shutdown_tx.send(());

    let report = app.run().await?;
    info!(
        messages = report.messages,
        delivered = report.delivered,
        failed = report.failed,
        "Dispatcher stopped."
    );

    if let Some(handle) = metrics_task {
        if let Err(e) = handle.await {
            error!("Metrics task panicked: {:?}", e);
        }
    }
    Ok(())
}

/// Returns whether every address accepted the test message.
async fn run_test(config: &Config, recipients: &[String]) -> Result<bool> {
    let providers = build_providers(config)?;
    let results = providers.send_test(recipients, TEST_MESSAGE).await;

    let mut failed = false;
    for (address, result) in results {
        match result {
            Ok(()) => println!("send to {} succ", address),
            Err(e) => {
                failed = true;
                println!("send to {} fail: {}", address, e);
            }
        }
    }
    Ok(!failed)
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
