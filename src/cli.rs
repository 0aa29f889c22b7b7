//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. Flags that mirror configuration keys are merged over the
//! `telegram-sender.toml` file and environment variables by implementing
//! `figment::Provider`.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Drains the alert queue and delivers each message to chat providers.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum number of deliveries in flight.
    #[arg(long, value_name = "N")]
    pub worker: Option<usize>,

    /// Name of the queue to drain.
    #[arg(long, value_name = "NAME")]
    pub queue: Option<String>,

    /// Log filter directive, e.g. `debug`.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Consume the queue until interrupted (the default).
    Run,
    /// Deliver everything currently queued, then exit.
    Drain,
    /// Send a test message to each address and report the outcome.
    Test {
        /// Recipient addresses, e.g. `tg|123456` or `mango|ops-room`.
        #[arg(required = true, value_name = "ADDRESS")]
        recipients: Vec<String>,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut consumer = Dict::new();
        if let Some(worker) = self.worker {
            consumer.insert("worker".into(), Value::from(worker as u64));
        }
        if let Some(queue) = &self.queue {
            consumer.insert("queue".into(), Value::from(queue.clone()));
        }

        let mut log = Dict::new();
        if let Some(level) = &self.log_level {
            log.insert("level".into(), Value::from(level.clone()));
        }

        let mut dict = Dict::new();
        if !consumer.is_empty() {
            dict.insert("consumer".into(), Value::from(consumer));
        }
        if !log.is_empty() {
            dict.insert("log".into(), Value::from(log));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
