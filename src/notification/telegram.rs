//! A client for the token-based bot API.

use crate::config::TelegramConfig;
use crate::core::ProviderClient;
use crate::notification::http::read_json;
use crate::notification::{DeliveryError, ProviderKind};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

/// The bot API's reply. The live API reports failures as
/// `error_code`/`description`, older relays as `errcode`/`errmsg`.
#[derive(Debug, Deserialize, Default)]
struct BotReply {
    #[serde(default, alias = "error_code")]
    errcode: i64,
    #[serde(default, alias = "description")]
    errmsg: String,
}

/// Sends messages with `GET {base}/bot{token}/sendMessage`.
pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TelegramClient {
    /// Creates a new `TelegramClient` over the shared transport.
    pub fn new(http: reqwest::Client, config: &TelegramConfig) -> Self {
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            config.base_url.trim_end_matches('/'),
            config.token
        );
        Self { http, endpoint }
    }
}

#[async_trait]
impl ProviderClient for TelegramClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Telegram
    }

    #[instrument(skip(self, text), fields(provider = "tg"))]
    async fn deliver(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("chat_id", target), ("text", text)])
            .send()
            .await
            .map_err(DeliveryError::Transport)?;

        let status = response.status();
        let reply: BotReply = read_json(response).await?;
        debug!(%status, errcode = reply.errcode, "Bot API replied");

        if reply.errcode != 0 {
            return Err(DeliveryError::Provider {
                code: reply.errcode,
                message: reply.errmsg,
            });
        }
        Ok(())
    }
}
