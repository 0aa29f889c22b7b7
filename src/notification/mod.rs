//! Delivery of rendered text to chat providers.
//!
//! A recipient address names its provider with a discriminator
//! (`tg|<chat-id>`, `mango|<room>`). The address is parsed once into a
//! [`RecipientAddress`] and routed through a [`ProviderSet`] to the matching
//! [`ProviderClient`]. Every client shares one HTTP transport built by
//! [`http::build_client`].
pub mod gateway;
pub mod http;
pub mod telegram;

pub use gateway::GatewayClient;
pub use telegram::TelegramClient;

use crate::core::ProviderClient;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// The chat providers a recipient address can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Token-based bot API, addressed by chat id.
    Telegram,
    /// Room-based IM gateway, addressed by room name.
    Gateway,
}

impl ProviderKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::Telegram => "tg",
            ProviderKind::Gateway => "mango",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("malformed recipient address {0:?}, expected <provider>|<target>")]
    Malformed(String),

    #[error("unknown provider {provider:?} in recipient address {address:?}")]
    UnknownProvider { provider: String, address: String },
}

/// A parsed `<provider-tag>|<target>` routing string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientAddress {
    pub kind: ProviderKind,
    pub target: String,
}

impl FromStr for RecipientAddress {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (tag, target) = raw
            .split_once('|')
            .ok_or_else(|| AddressError::Malformed(raw.to_string()))?;
        if tag.is_empty() || target.is_empty() {
            return Err(AddressError::Malformed(raw.to_string()));
        }
        let kind = match tag {
            "tg" => ProviderKind::Telegram,
            "mango" => ProviderKind::Gateway,
            other => {
                return Err(AddressError::UnknownProvider {
                    provider: other.to_string(),
                    address: raw.to_string(),
                })
            }
        };
        Ok(Self {
            kind,
            target: target.to_string(),
        })
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.kind, self.target)
    }
}

/// Why a single delivery failed. Scoped to one recipient.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("no client configured for provider {0}")]
    ProviderNotConfigured(ProviderKind),

    #[error("invoke send api fail: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("parse send api response fail: {source}; body: {body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },

    #[error("invoke send api return ErrCode = {code}: {message}")]
    Provider { code: i64, message: String },

    #[error("invoke send api partial fail, invalid user: {invalid_user}, invalid party: {invalid_party}, invalid tag: {invalid_tag}")]
    PartialRejection {
        invalid_user: String,
        invalid_party: String,
        invalid_tag: String,
    },
}

impl DeliveryError {
    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Address(_) => "address",
            DeliveryError::ProviderNotConfigured(_) => "not_configured",
            DeliveryError::Transport(_) => "transport",
            DeliveryError::Decode { .. } => "decode",
            DeliveryError::Provider { .. } => "provider",
            DeliveryError::PartialRejection { .. } => "partial_rejection",
        }
    }
}

/// Routes recipient addresses to the client registered for their provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    clients: HashMap<ProviderKind, Arc<dyn ProviderClient>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` under its own kind, replacing any previous one.
    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.kind(), client);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn ProviderClient>> {
        self.clients.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Parses `address` and delivers `text` through the matching client.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn deliver(&self, address: &str, text: &str) -> Result<ProviderKind, DeliveryError> {
        let recipient: RecipientAddress = address.parse()?;
        let client = self
            .get(recipient.kind)
            .ok_or(DeliveryError::ProviderNotConfigured(recipient.kind))?;
        client.deliver(&recipient.target, text).await?;
        debug!(provider = %recipient.kind, "Delivered");
        Ok(recipient.kind)
    }

    /// Sends `text` to each address in turn and reports every outcome.
    pub async fn send_test(
        &self,
        addresses: &[String],
        text: &str,
    ) -> Vec<(String, Result<(), DeliveryError>)> {
        let mut outcomes = Vec::with_capacity(addresses.len());
        for address in addresses {
            let outcome = self.deliver(address, text).await.map(|_| ());
            outcomes.push((address.clone(), outcome));
        }
        outcomes
    }
}
