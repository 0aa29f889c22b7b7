//! Work queue adapters.
//!
//! Producers push JSON-encoded [`Message`]s onto a named list; this module
//! pops and decodes them. An item that fails to decode is logged and
//! skipped without affecting the rest of its batch.
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod redis_list;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryQueue;
pub use redis_list::RedisQueue;

use crate::core::Message;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] ::redis::RedisError),

    #[error("queue operation timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid redis address {0:?}, expected host:port")]
    InvalidAddress(String),
}

/// Decodes raw queue items, dropping (and logging) the ones that are not
/// valid messages.
pub fn decode_batch<I, S>(queue: &str, items: I) -> Vec<Message>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .filter_map(|item| {
            let raw = item.as_ref();
            if raw.is_empty() || raw == "nil" {
                return None;
            }
            match serde_json::from_str::<Message>(raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    metrics::counter!("queue_decode_failures_total").increment(1);
                    error!(queue, error = %e, item = raw, "Failed to decode queue item, skipping");
                    None
                }
            }
        })
        .collect()
}
