//! Configuration management for telegram-sender
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer built-in defaults, a TOML file, environment variables and
//! command-line flags, in that order of precedence.

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::cli::Cli;

/// Used when `--config` is not given. A missing default file is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "etc/telegram-sender.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging output settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// An `EnvFilter` directive, e.g. `info` or `telegram_sender=debug`.
    pub level: String,
    /// Write hourly-rotated files here instead of stdout.
    pub dir: Option<PathBuf>,
    /// How many hourly files to keep.
    pub keep_hours: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            keep_hours: 2,
        }
    }
}

/// Queue consumption and delivery concurrency.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsumerConfig {
    /// Name of the queue to drain.
    pub queue: String,
    /// Maximum number of deliveries in flight at once.
    pub worker: usize,
    /// Messages requested per pop.
    pub batch_size: usize,
    /// Sleep between polls of an empty queue.
    pub idle_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "/n9e/sender/im".to_string(),
            worker: 10,
            batch_size: 1,
            idle_backoff_ms: 300,
        }
    }
}

/// Connection settings for the Redis-backed queue.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    /// `host:port` of the Redis server.
    pub addr: String,
    pub pass: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub timeout: RedisTimeoutConfig,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            pass: None,
            db: 0,
            timeout: RedisTimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisTimeoutConfig {
    pub conn_ms: u64,
    pub read_ms: u64,
}

impl Default for RedisTimeoutConfig {
    fn default() -> Self {
        Self {
            conn_ms: 500,
            read_ms: 3000,
        }
    }
}

/// Credentials for the bot API.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub base_url: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            base_url: "https://api.telegram.org".to_string(),
        }
    }
}

/// Credentials for the IM gateway.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Sent verbatim as the `Authorization` header.
    pub authorization: String,
    pub base_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            authorization: String::new(),
            base_url: "https://im.imangoim.com:9091/plugins/xhcodrestapi/v1/apiservice"
                .to_string(),
        }
    }
}

/// Settings for the HTTP transport shared by all providers.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Upper bound on one whole request, headers and body included.
    pub request_timeout_ms: u64,
    pub accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            read_timeout_ms: 1000,
            request_timeout_ms: 3000,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TemplateConfig {
    /// Resolved relative to the working directory.
    pub path: PathBuf,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("etc/telegram.tpl"),
        }
    }
}

/// Configuration for the periodic metrics log.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsConfig {
    pub log_metrics: bool,
    pub log_aggregation_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_metrics: false,
            log_aggregation_seconds: 60,
        }
    }
}

impl Config {
    /// Loads the configuration, layering defaults, the TOML file,
    /// `TELEGRAM_SENDER_*` environment variables and CLI flags.
    pub fn load_from_cli(cli: &Cli) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found at specified path: {}", path.display());
                }
                path.clone()
            }
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };
        Self::figment(&path).merge(cli.clone()).extract::<Config>()?.validated()
    }

    /// Loads the configuration from a file and the environment only.
    pub fn load(path: &Path) -> Result<Self> {
        Self::figment(path).extract::<Config>()?.validated()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            // e.g. TELEGRAM_SENDER_CONSUMER__WORKER=20
            .merge(Env::prefixed("TELEGRAM_SENDER_").split("__"))
    }

    /// Rejects values the dispatcher cannot run with.
    pub fn validated(self) -> Result<Self> {
        if self.consumer.worker == 0 {
            bail!("consumer.worker must be at least 1");
        }
        if self.consumer.batch_size == 0 {
            bail!("consumer.batch_size must be at least 1");
        }
        if self.consumer.queue.trim().is_empty() {
            bail!("consumer.queue must not be empty");
        }
        Ok(self)
    }
}
