//! Long-term memory search against a mem0-compatible REST service.
//!
//! The agent offers a `search_memory` tool to the model when a memory key is
//! configured; each call goes through [`MemorySearch`].

use crate::config::{self, Config};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("memory api error: {0}")]
    Api(String),
}

/// One stored memory returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait MemorySearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>, MemoryError>;
}

/// The service answers with either a bare array or `{ "results": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    List(Vec<MemoryRecord>),
    Wrapped { results: Vec<MemoryRecord> },
}

impl From<SearchResponse> for Vec<MemoryRecord> {
    fn from(res: SearchResponse) -> Self {
        match res {
            SearchResponse::List(v) | SearchResponse::Wrapped { results: v } => v,
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
}

/// mem0 REST client scoped to one user id.
#[derive(Clone)]
pub struct MemoryClient {
    base_url: String,
    api_key: String,
    user_id: String,
    client: reqwest::Client,
}

impl MemoryClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            user_id: user_id.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from config; None when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let key = config::resolve_memory_api_key(config)?;
        Some(Self::new(
            config.memory.base_url.clone(),
            key,
            config::resolve_memory_user_id(config),
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl MemorySearch for MemoryClient {
    async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        let url = format!("{}/v1/memories/search/", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&SearchRequest {
                query,
                user_id: &self.user_id,
            })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(MemoryError::Api(format!("{} {}", status, body)));
        }
        let parsed: SearchResponse = res.json().await?;
        let records: Vec<MemoryRecord> = parsed.into();
        log::debug!("memory: {} result(s) for query of {} chars", records.len(), query.len());
        Ok(records)
    }
}

/// Tool result text for the model: one memory per line, or a fixed notice when nothing matched.
pub fn format_records(records: &[MemoryRecord]) -> String {
    if records.is_empty() {
        return "no related memories found".to_string();
    }
    records
        .iter()
        .map(|r| format!("- {}", r.memory.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
