//! An in-memory `QueueSource` for tests.

use crate::core::{Message, QueueSource};
use crate::queue::{decode_batch, QueueError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A queue backed by a `VecDeque` of raw JSON items, popped from the front.
///
/// Raw items go through the same decoding as the Redis queue, so malformed
/// payloads can be injected with [`MemoryQueue::push_raw`].
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    pops: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: &Message) {
        let raw = serde_json::to_string(message).expect("message serialises");
        self.push_raw(raw);
    }

    pub fn push_raw(&self, raw: impl Into<String>) {
        self.items.lock().unwrap().push_back(raw.into());
    }

    /// How many times `pop` has been called.
    pub fn pop_count(&self) -> usize {
        self.pops.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueSource for MemoryQueue {
    async fn pop(&self, count: usize, queue: &str) -> Result<Vec<Message>, QueueError> {
        self.pops.fetch_add(1, Ordering::SeqCst);
        let raw: Vec<String> = {
            let mut items = self.items.lock().unwrap();
            let take = count.min(items.len());
            items.drain(..take).collect()
        };
        Ok(decode_batch(queue, raw))
    }
}
