//! Core domain types and service traits for the notification dispatcher
//!
//! This module defines the records popped from the work queue and the trait
//! contracts that connect the dispatcher to its collaborators: the queue it
//! drains, the renderer that turns a message into text, and the chat
//! providers that deliver that text.

use crate::notification::{DeliveryError, ProviderKind};
use crate::queue::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Whether an event reports a problem or the end of one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    Alert,
    Recovery,
    /// Any other upstream value, kept verbatim.
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Recovery => "recovery",
            EventKind::Other(raw) => raw,
        }
    }
}

impl From<&str> for EventKind {
    fn from(raw: &str) -> Self {
        match raw {
            "alert" => EventKind::Alert,
            "recovery" => EventKind::Recovery,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventKind::from(raw.as_str()))
    }
}

/// The observed value attached to an event.
///
/// Upstream producers send either a JSON number or a string holding one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventValue {
    Number(f64),
    Text(String),
}

impl Default for EventValue {
    fn default() -> Self {
        EventValue::Number(0.0)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Number(n) => write!(f, "{}", n),
            EventValue::Text(raw) => match raw.trim().parse::<f64>() {
                Ok(n) => write!(f, "{}", n),
                Err(_) => f.write_str(raw),
            },
        }
    }
}

/// An alert or recovery occurrence, read-only within this system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Event {
    /// Stable identifier of the alerting series.
    #[serde(rename = "hashid", default)]
    pub hash_id: u64,
    #[serde(rename = "event_type", default)]
    pub kind: EventKind,
    #[serde(default)]
    pub priority: i32,
    /// Name of the strategy (or entity) that raised the event.
    #[serde(rename = "sname", default)]
    pub name: String,
    #[serde(default)]
    pub value: EventValue,
    #[serde(default)]
    pub info: String,
    /// Occurrence time in epoch seconds.
    #[serde(rename = "etime", default)]
    pub occurred_at: i64,
}

/// The unit of work popped from the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Message {
    pub event: Event,
    #[serde(default)]
    pub readable_endpoint: String,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub readable_tags: String,
    #[serde(default)]
    pub is_upgrade: bool,
    #[serde(default)]
    pub bindings: Vec<String>,
    /// Recipient addresses, `<provider>|<target>`. May be empty.
    #[serde(default)]
    pub tos: Vec<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub event_link: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub stra_link: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub claim_link: Option<String>,
}

impl Message {
    pub fn hash_id(&self) -> u64 {
        self.event.hash_id
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()))
}

// =============================================================================
// Service Traits
// =============================================================================

/// A destructive, non-blocking reader over a named work queue.
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Pops up to `count` messages from `queue`.
    ///
    /// # Returns
    /// * `Ok(vec![])` when the queue is currently empty
    /// * `Ok(messages)` with every item that decoded; undecodable items are
    ///   logged and skipped
    /// * `Err` only when the queue itself could not be read
    async fn pop(&self, count: usize, queue: &str) -> Result<Vec<Message>, QueueError>;
}

/// Turns a message into the text delivered to its recipients.
///
/// Implementations never fail: a rendering problem is reported inside the
/// returned text so recipients see it.
pub trait Renderer: Send + Sync {
    fn render(&self, message: &Message) -> String;
}

/// Delivers text to one target on a single chat provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// The discriminator this client serves.
    fn kind(&self) -> ProviderKind;

    /// Sends `text` to `target` (a chat id, room name, ...).
    ///
    /// # Returns
    /// * `Ok(())` when the provider accepted the message for every recipient
    /// * `Err` for transport, decoding, provider-reported or partial failures
    async fn deliver(&self, target: &str, text: &str) -> Result<(), DeliveryError>;
}
