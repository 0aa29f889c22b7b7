//! The HTTP transport shared by every provider client.

use crate::config::HttpConfig;
use crate::notification::DeliveryError;
use anyhow::{Context, Result};
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Builds the process-wide client. `reqwest::Client` pools connections
/// internally and is cheap to clone, so build it once and hand out clones.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .read_timeout(Duration::from_millis(config.read_timeout_ms))
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .build()
        .context("Failed to build HTTP client")
}

/// Reads the whole response body, then decodes it as JSON.
///
/// The body is always consumed before decoding so the connection goes back
/// to the pool on success and on every failure path.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, DeliveryError> {
    let body = response.bytes().await.map_err(DeliveryError::Transport)?;
    serde_json::from_slice(&body).map_err(|source| DeliveryError::Decode {
        source,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}
