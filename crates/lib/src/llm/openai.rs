//! OpenAI-compatible client: POST {base}/chat/completions with stream: true (SSE).

use super::{ChatMessage, LlmError, ToolCall, ToolCallFunction, ToolDefinition};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1234/v1";

/// Client for any server exposing the OpenAI chat completions API.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

/// Accumulated result of one streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            api_key,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Streaming chat. Calls `on_delta` for each content delta in order; returns the full message and any tool calls.
    /// Stops with `LlmError::Cancelled` as soon as `cancel` fires.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        cancel: &CancellationToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model,
            messages,
            stream: true,
            tools,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            res = req.send() => res?,
        };
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }

        let mut stream = res.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut acc = StreamAccumulator::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(LlmError::Request)?;
            buffer.extend_from_slice(&chunk);
            while let Some((pos, sep)) = find_event_boundary(&buffer) {
                let block: Vec<u8> = buffer.drain(..pos).collect();
                buffer.drain(..sep);
                if acc.push_block(&String::from_utf8_lossy(&block), on_delta) {
                    return Ok(acc.finish());
                }
            }
        }
        if !buffer.is_empty() {
            acc.push_block(&String::from_utf8_lossy(&buffer), on_delta);
        }
        Ok(acc.finish())
    }
}

/// Position and length of the first SSE event separator (`\n\n` or `\r\n\r\n`).
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Folds SSE events into content and tool calls.
#[derive(Debug, Default)]
struct StreamAccumulator {
    content: String,
    tool_calls: Vec<PartialToolCall>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    typ: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Apply one SSE event block. Returns true on `[DONE]`.
    fn push_block(&mut self, block: &str, on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send)) -> bool {
        for line in block.lines() {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else { continue };
            let data = data.trim();
            if data == "[DONE]" {
                return true;
            }
            let Ok(ev) = serde_json::from_str::<StreamChunk>(data) else {
                log::debug!("llm: skipping unparsable stream event");
                continue;
            };
            let Some(delta) = ev.choices.into_iter().next().and_then(|c| c.delta) else {
                continue;
            };
            if let Some(c) = delta.content.filter(|c| !c.is_empty()) {
                on_delta(&c);
                self.content.push_str(&c);
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let idx = tc.index.unwrap_or(0) as usize;
                while self.tool_calls.len() <= idx {
                    self.tool_calls.push(PartialToolCall::default());
                }
                let slot = &mut self.tool_calls[idx];
                if let Some(id) = tc.id {
                    slot.id = id;
                }
                if let Some(typ) = tc.typ {
                    slot.typ = typ;
                }
                if let Some(f) = tc.function {
                    if let Some(n) = f.name {
                        slot.name.push_str(&n);
                    }
                    if let Some(a) = f.arguments {
                        slot.arguments.push_str(&a);
                    }
                }
            }
        }
        false
    }

    fn finish(self) -> ChatResponse {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .enumerate()
            .filter(|(_, tc)| !tc.name.is_empty())
            .map(|(i, tc)| ToolCall {
                id: if tc.id.is_empty() { format!("call_{}", i) } else { tc.id },
                typ: if tc.typ.is_empty() { "function".to_string() } else { tc.typ },
                function: ToolCallFunction {
                    name: tc.name,
                    arguments: tc.arguments,
                },
            })
            .collect();
        ChatResponse {
            content: self.content,
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaToolCall {
    index: Option<u32>,
    id: Option<String>,
    #[serde(rename = "type")]
    typ: Option<String>,
    function: Option<StreamDeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaFunction {
    name: Option<String>,
    arguments: Option<String>,
}
