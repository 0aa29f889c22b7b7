//! Process-wide `tracing` subscriber setup.

use crate::config::LogConfig;
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "telegram-sender";

/// Installs the global subscriber.
///
/// With `dir` set, output goes to hourly files under it and the returned
/// guard must be held until exit so buffered lines are flushed. Otherwise
/// output goes to stdout and no guard is returned.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level directive: {}", config.level))?;

    match &config.dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::HOURLY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .max_log_files(config.keep_hours.max(1))
                .build(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
            Ok(None)
        }
    }
}

