//! Gateway wire types: side-channel HTTP bodies and WebSocket close codes.

use serde::{Deserialize, Serialize};

/// Close code sent to a connection whose client id is already taken.
pub const CLOSE_DUPLICATE_CLIENT: u16 = 4000;
pub const CLOSE_DUPLICATE_REASON: &str = "client already connected";

/// Close code (going away) sent to every connection on shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_SHUTDOWN_REASON: &str = "server shutting down";

/// Body of `POST /send_message`. `context` / `channel_id` are accepted for older scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectSendRequest {
    #[serde(alias = "context")]
    pub content: String,
    #[serde(alias = "channel_id")]
    pub client_id: String,
}

/// Reply to `POST /send_message`: `{"ok":true}` or `{"ok":false,"error":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectSendResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectSendResponse {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// `GET /` payload (for probes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub runtime: String,
    pub clients: usize,
    pub port: u16,
}

/// Text frame sent back for a frame the normalizer rejected.
pub fn error_frame(detail: impl std::fmt::Display) -> String {
    format!("error: {}", detail)
}
