//! HTTP client for the gateway side channel (list clients, directed send).

use crate::gateway::{DirectSendRequest, DirectSendResponse};
use crate::registry::ClientId;
use anyhow::{Context, Result};
use reqwest::StatusCode;

/// Default side-channel base URL (loopback, default port).
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8000";

#[derive(Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// GET /get_channel_id
    pub async fn list_clients(&self) -> Result<Vec<ClientId>> {
        let url = format!("{}/get_channel_id", self.base_url);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()?;
        res.json().await.context("parsing client list")
    }

    /// POST /send_message. Unknown or gone clients come back as `ok: false`, not as `Err`.
    pub async fn send_message(&self, client_id: &str, content: &str) -> Result<DirectSendResponse> {
        let url = format!("{}/send_message", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&DirectSendRequest {
                content: content.to_string(),
                client_id: client_id.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        match res.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND || s == StatusCode::GONE => {
                res.json().await.context("parsing send_message response")
            }
            s => {
                let body = res.text().await.unwrap_or_default();
                anyhow::bail!("send_message failed: {} {}", s, body)
            }
        }
    }
}

/// WebSocket URL for `client_id` given the side-channel base URL (`http` -> `ws`).
pub fn ws_url(base_url: &str, client_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws/{}", base, client_id)
}
