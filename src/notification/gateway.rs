//! A client for the room-based IM gateway.

use crate::config::GatewayConfig;
use crate::core::ProviderClient;
use crate::notification::http::read_json;
use crate::notification::{DeliveryError, ProviderKind};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Debug, Serialize)]
struct RoomMessage<'a> {
    #[serde(rename = "roomname")]
    room_name: &'a str,
    text: &'a str,
}

/// The gateway's reply. Non-empty `invalid*` fields name the members of a
/// distribution list that were rejected, whatever `errcode` says.
#[derive(Debug, Deserialize, Default)]
struct GatewayReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default, rename = "invaliduser")]
    invalid_user: String,
    #[serde(default, rename = "invalidparty")]
    invalid_party: String,
    /// Older gateway builds misspell the party field.
    #[serde(default, rename = "infvalidparty")]
    legacy_invalid_party: String,
    #[serde(default, rename = "invalidtag")]
    invalid_tag: String,
}

impl GatewayReply {
    /// Rejected members are reported ahead of the error code so their
    /// literal values reach the log.
    fn into_result(self) -> Result<(), DeliveryError> {
        let invalid_party = if self.invalid_party.is_empty() {
            self.legacy_invalid_party
        } else {
            self.invalid_party
        };
        if !self.invalid_user.is_empty() || !invalid_party.is_empty() || !self.invalid_tag.is_empty() {
            return Err(DeliveryError::PartialRejection {
                invalid_user: self.invalid_user,
                invalid_party,
                invalid_tag: self.invalid_tag,
            });
        }
        if self.errcode != 0 {
            return Err(DeliveryError::Provider {
                code: self.errcode,
                message: self.errmsg,
            });
        }
        Ok(())
    }
}

/// Sends messages with `POST {base}/{token}/sendmessage`.
pub struct GatewayClient {
    http: reqwest::Client,
    endpoint: String,
    authorization: String,
}

impl GatewayClient {
    /// Creates a new `GatewayClient` over the shared transport.
    pub fn new(http: reqwest::Client, config: &GatewayConfig) -> Self {
        let endpoint = format!(
            "{}/{}/sendmessage",
            config.base_url.trim_end_matches('/'),
            config.token
        );
        Self {
            http,
            endpoint,
            authorization: config.authorization.clone(),
        }
    }
}

#[async_trait]
impl ProviderClient for GatewayClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gateway
    }

    #[instrument(skip(self, text), fields(provider = "mango"))]
    async fn deliver(&self, target: &str, text: &str) -> Result<(), DeliveryError> {
        let body = RoomMessage {
            room_name: target,
            text,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, "application/json;charset=UTF-8")
            .json(&body)
            .send()
            .await
            .map_err(DeliveryError::Transport)?;

        let status = response.status();
        let reply: GatewayReply = read_json(response).await?;
        debug!(%status, errcode = reply.errcode, "Gateway replied");
        reply.into_result()
    }
}
