//! telegram-sender - a notification dispatcher.
//!
//! Drains a queue of alert and recovery events, renders each once, and fans
//! the text out to chat providers with bounded concurrency.

pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod formatting;
pub mod internal_metrics;
pub mod logging;
pub mod notification;
pub mod queue;

// Re-export core types for convenience
pub use crate::core::*;
