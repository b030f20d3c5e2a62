//! Agent runtime: one turn per inbound envelope, streamed as tokens.
//!
//! [`AgentRuntime`] is the seam the router calls. [`ChatAgent`] is the built-in
//! implementation: session history + system context + OpenAI-compatible streaming,
//! with an optional `search_memory` tool. When the model returns tool calls we
//! execute them and re-call the model until done (bounded).

use crate::config::{self, Config};
use crate::envelope::{ContentPart, MessageEnvelope};
use crate::llm::{
    ChatMessage, LlmError, MessageContent, OpenAiClient, ToolCall, ToolDefinition, ToolFunctionDefinition,
};
use crate::memory::{self, MemoryClient, MemorySearch};
use crate::session::SessionStore;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_TOOL_LOOP: usize = 5;

/// Used when no model is configured (LM Studio's default download).
pub const DEFAULT_MODEL_FALLBACK: &str = "gpt-oss-20b";

const SEARCH_MEMORY_TOOL: &str = "search_memory";

/// One unit of agent output. A stream is any number of tokens, then exactly one terminal unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputUnit {
    Token(String),
    Done,
    Failed(String),
}

impl OutputUnit {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutputUnit::Token(_))
    }
}

/// Where a runtime pushes tokens. Terminal units are added by the router, not the runtime.
#[derive(Clone)]
pub struct TokenSink {
    tx: mpsc::UnboundedSender<OutputUnit>,
}

impl TokenSink {
    pub fn new(tx: mpsc::UnboundedSender<OutputUnit>) -> Self {
        Self { tx }
    }

    /// Push one token. Returns false once the consumer is gone. Empty tokens are skipped.
    pub fn token(&self, text: &str) -> bool {
        if text.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(OutputUnit::Token(text.to_string())).is_ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(LlmError),
    #[error("session store: {0}")]
    Session(#[from] std::io::Error),
    #[error("agent invocation cancelled")]
    Cancelled,
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Cancelled => AgentError::Cancelled,
            e => AgentError::Llm(e),
        }
    }
}

/// Runs one agent turn for an envelope under a session key, pushing tokens into `sink`.
/// Implementations should stop early once `cancel` fires, but are not required to.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(
        &self,
        session_key: &str,
        envelope: &MessageEnvelope,
        sink: &TokenSink,
        cancel: CancellationToken,
    ) -> Result<(), AgentError>;
}

/// Load agent context from the workspace (AGENTS.md). None when missing or empty.
pub fn load_agent_ctx(workspace_dir: Option<&Path>) -> Option<String> {
    let path = workspace_dir?.join("AGENTS.md");
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}

/// Built-in runtime over an OpenAI-compatible chat endpoint.
pub struct ChatAgent {
    llm: OpenAiClient,
    model: String,
    sessions: Arc<SessionStore>,
    memory: Option<Arc<dyn MemorySearch>>,
    agent_ctx: Option<String>,
    max_history: usize,
}

impl ChatAgent {
    pub fn new(llm: OpenAiClient, model: Option<String>, sessions: Arc<SessionStore>) -> Self {
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                log::warn!("agent: no model configured, using fallback {}", DEFAULT_MODEL_FALLBACK);
                DEFAULT_MODEL_FALLBACK.to_string()
            });
        Self {
            llm,
            model,
            sessions,
            memory: None,
            agent_ctx: None,
            max_history: 40,
        }
    }

    pub fn with_memory(mut self, memory: Option<Arc<dyn MemorySearch>>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_agent_ctx(mut self, ctx: Option<String>) -> Self {
        self.agent_ctx = ctx;
        self
    }

    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = max;
        self
    }

    /// Wire up model client, persisted sessions, workspace context and memory from config.
    pub async fn from_config(config: &Config) -> Self {
        let llm = OpenAiClient::new(
            Some(config.agents.base_url.clone()),
            config::resolve_llm_api_key(config),
        );
        let state_file = config::resolve_state_file(config);
        let sessions = Arc::new(SessionStore::load(&state_file).await);
        log::info!("agent: session history at {}", state_file.display());

        let workspace = config::resolve_workspace_dir(config);
        let agent_ctx = load_agent_ctx(workspace.as_deref());
        if agent_ctx.is_some() {
            log::info!("agent: loaded AGENTS.md context");
        }
        let memory = MemoryClient::from_config(config).map(|m| {
            log::info!("agent: memory search enabled for user {}", m.user_id());
            Arc::new(m) as Arc<dyn MemorySearch>
        });

        Self::new(llm, config.agents.model.clone(), sessions)
            .with_agent_ctx(agent_ctx)
            .with_memory(memory)
            .with_max_history(config.agents.max_history)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "Current date: {}",
            chrono::Local::now().format("%Y-%m-%d (%A)")
        );
        if let Some(ref ctx) = self.agent_ctx {
            prompt.push_str("\n\n");
            prompt.push_str(ctx.trim());
        }
        prompt
    }

    fn tools(&self) -> Option<Vec<ToolDefinition>> {
        self.memory.as_ref().map(|_| vec![search_memory_tool()])
    }

    async fn execute_tool(&self, call: &ToolCall) -> String {
        let name = call.function.name.as_str();
        if name != SEARCH_MEMORY_TOOL {
            log::warn!("agent: model requested unknown tool {}", name);
            return format!("error: unknown tool: {}", name);
        }
        let Some(ref memory) = self.memory else {
            return "error: memory search is not configured".to_string();
        };
        let query = match serde_json::from_str::<serde_json::Value>(&call.function.arguments) {
            Ok(v) => v.get("query").and_then(|q| q.as_str()).unwrap_or_default().to_string(),
            Err(e) => return format!("error: invalid arguments: {}", e),
        };
        if query.trim().is_empty() {
            return "error: query is required".to_string();
        }
        match memory.search(&query).await {
            Ok(records) => memory::format_records(&records),
            Err(e) => {
                log::warn!("agent: memory search failed: {}", e);
                format!("error: {}", e)
            }
        }
    }

    /// Model rounds until a reply without tool calls. Every produced message is pushed to `produced`.
    async fn run_rounds(
        &self,
        messages: &mut Vec<ChatMessage>,
        produced: &mut Vec<ChatMessage>,
        sink: &TokenSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let tools = self.tools();
        for round in 0..MAX_TOOL_LOOP {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            // Last round goes without tools so the model has to answer.
            let round_tools = if round + 1 < MAX_TOOL_LOOP { tools.as_deref() } else { None };
            let mut on_delta = |s: &str| {
                sink.token(s);
            };
            let res = self
                .llm
                .chat_stream(&self.model, messages, round_tools, cancel, &mut on_delta)
                .await?;
            log::debug!(
                "agent: round {} returned {} chars, {} tool call(s)",
                round,
                res.content.len(),
                res.tool_calls.len()
            );
            let assistant = ChatMessage::assistant(res.content, res.tool_calls.clone());
            messages.push(assistant.clone());
            produced.push(assistant);
            if res.tool_calls.is_empty() {
                return Ok(());
            }
            for call in &res.tool_calls {
                let result = self.execute_tool(call).await;
                let msg = ChatMessage::tool(call.id.clone(), result);
                messages.push(msg.clone());
                produced.push(msg);
            }
        }
        log::debug!("agent: max tool loop iterations reached");
        Ok(())
    }
}

#[async_trait]
impl AgentRuntime for ChatAgent {
    async fn invoke(
        &self,
        session_key: &str,
        envelope: &MessageEnvelope,
        sink: &TokenSink,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let mut history = self.sessions.history(session_key).await;
        trim_history(&mut history, self.max_history);
        let user = user_message(envelope);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt()));
        messages.extend(history);
        messages.push(user.clone());
        log::info!(
            "agent: turn for {} (session {}, {} message(s), model {})",
            envelope.client_id(),
            session_key,
            messages.len(),
            self.model
        );

        let mut produced = vec![user];
        let result = self.run_rounds(&mut messages, &mut produced, sink, &cancel).await;
        if let Err(e) = self.sessions.append(session_key, produced).await {
            log::warn!("agent: persisting session {} failed: {}", session_key, e);
            result?;
            return Err(AgentError::Session(e));
        }
        result
    }
}

/// Model-facing user message: a channel id line first, then the envelope parts.
/// Text-only envelopes become one string; anything with media stays as parts.
pub fn user_message(envelope: &MessageEnvelope) -> ChatMessage {
    let tag = format!("Message channel id: {}", envelope.client_id());
    if envelope.is_text_only() {
        let mut text = tag;
        for part in envelope.parts() {
            if let Some(t) = part.as_text() {
                text.push('\n');
                text.push_str(t);
            }
        }
        return ChatMessage::user(MessageContent::Text(text));
    }
    let mut parts = Vec::with_capacity(envelope.parts().len() + 1);
    parts.push(ContentPart::text(tag));
    parts.extend(envelope.parts().iter().cloned());
    ChatMessage::user(MessageContent::Parts(parts))
}

/// Keep the newest `max` messages, never starting on an orphaned tool result.
pub fn trim_history(history: &mut Vec<ChatMessage>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
    let orphans = history.iter().take_while(|m| m.role == "tool").count();
    history.drain(..orphans);
}

fn search_memory_tool() -> ToolDefinition {
    ToolDefinition {
        typ: "function".to_string(),
        function: ToolFunctionDefinition {
            name: SEARCH_MEMORY_TOOL.to_string(),
            description: Some(
                "Search long-term memory about the user (preferences, facts, past events). \
                 Use when the answer may depend on something said in an earlier conversation."
                    .to_string(),
            ),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to look up." }
                },
                "required": ["query"]
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryError, MemoryRecord};
    use axum::{extract::State, http::header, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn text_envelope(client: &str, text: &str) -> MessageEnvelope {
        MessageEnvelope::new(client, vec![ContentPart::text(text)], None)
    }

    #[derive(Clone)]
    struct FakeLlm {
        replies: Arc<Vec<String>>,
        calls: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn completions(State(s): State<FakeLlm>, Json(body): Json<serde_json::Value>) -> impl axum::response::IntoResponse {
        s.requests.lock().unwrap().push(body);
        let n = s.calls.fetch_add(1, Ordering::SeqCst);
        let reply = s.replies.get(n).cloned().unwrap_or_default();
        ([(header::CONTENT_TYPE, "text/event-stream")], reply)
    }

    fn sse(events: &[serde_json::Value]) -> String {
        let mut out = String::new();
        for e in events {
            out.push_str(&format!("data: {}\n\n", e));
        }
        out.push_str("data: [DONE]\n\n");
        out
    }

    fn content_event(text: &str) -> serde_json::Value {
        serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
    }

    async fn start_fake_llm(replies: Vec<String>) -> (String, FakeLlm) {
        let state = FakeLlm {
            replies: Arc::new(replies),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}/v1", addr), state)
    }

    struct FixedMemory;

    #[async_trait]
    impl MemorySearch for FixedMemory {
        async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
            Ok(vec![MemoryRecord {
                id: "m1".into(),
                memory: format!("remembered {}", query),
                score: None,
                metadata: None,
            }])
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutputUnit>) -> Vec<OutputUnit> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push(u);
        }
        out
    }

    #[test]
    fn trim_keeps_newest_and_drops_orphan_tool_results() {
        let mut h = vec![
            ChatMessage::user(MessageContent::Text("a".into())),
            ChatMessage::assistant("", vec![]),
            ChatMessage::tool("c1", "r1"),
            ChatMessage::tool("c2", "r2"),
            ChatMessage::assistant("b", vec![]),
        ];
        trim_history(&mut h, 3);
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].content.as_text(), "b");
    }

    #[test]
    fn user_message_carries_channel_id() {
        let m = user_message(&text_envelope("u1", "hello"));
        assert_eq!(m.content, MessageContent::Text("Message channel id: u1\nhello".into()));

        let env = MessageEnvelope::new(
            "u2",
            vec![
                ContentPart::text("see"),
                ContentPart::ImageUrl {
                    image_url: crate::envelope::ImageUrl {
                        url: "data:image/png;base64,AA".into(),
                        detail: None,
                    },
                },
            ],
            None,
        );
        match user_message(&env).content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], ContentPart::text("Message channel id: u2"));
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn agent_ctx_requires_non_empty_file() {
        let dir = std::env::temp_dir().join(format!("newbot-ws-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(load_agent_ctx(Some(&dir)).is_none());
        std::fs::write(dir.join("AGENTS.md"), "  \n").unwrap();
        assert!(load_agent_ctx(Some(&dir)).is_none());
        std::fs::write(dir.join("AGENTS.md"), "Be brief.").unwrap();
        assert_eq!(load_agent_ctx(Some(&dir)).as_deref(), Some("Be brief."));
        assert!(load_agent_ctx(None).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn streams_tokens_and_persists_turn() {
        let (url, llm) = start_fake_llm(vec![sse(&[content_event("Hi"), content_event(" there")])]).await;
        let sessions = Arc::new(SessionStore::in_memory());
        let agent = ChatAgent::new(OpenAiClient::new(Some(url), None), Some("m".into()), sessions.clone())
            .with_agent_ctx(Some("Be kind.".into()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent
            .invoke("1", &text_envelope("u1", "hello"), &TokenSink::new(tx), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![OutputUnit::Token("Hi".into()), OutputUnit::Token(" there".into())]
        );
        let history = sessions.history("1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content.as_text(), "Hi there");

        let req = llm.requests.lock().unwrap()[0].clone();
        assert_eq!(req["model"], "m");
        assert_eq!(req["stream"], true);
        assert!(req.get("tools").is_none());
        let system = req["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("Be kind."));
    }

    #[tokio::test]
    async fn tool_call_round_trip_uses_memory() {
        let tool_event = serde_json::json!({ "choices": [{ "delta": { "tool_calls": [{
            "index": 0, "id": "call_1", "type": "function",
            "function": { "name": "search_memory", "arguments": "{\"query\":\"tea\"}" }
        }] } }] });
        let (url, llm) = start_fake_llm(vec![sse(&[tool_event]), sse(&[content_event("Green tea.")])]).await;
        let sessions = Arc::new(SessionStore::in_memory());
        let agent = ChatAgent::new(OpenAiClient::new(Some(url), None), None, sessions.clone())
            .with_memory(Some(Arc::new(FixedMemory)));
        assert_eq!(agent.model(), DEFAULT_MODEL_FALLBACK);
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent
            .invoke("1", &text_envelope("u1", "what do I drink?"), &TokenSink::new(tx), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), vec![OutputUnit::Token("Green tea.".into())]);

        let roles: Vec<String> = sessions.history("1").await.into_iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);

        let requests = llm.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["tools"][0]["function"]["name"], "search_memory");
        let last = requests[1]["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["role"], "tool");
        assert_eq!(last["tool_call_id"], "call_1");
        assert_eq!(last["content"], "- remembered tea");
    }

    #[tokio::test]
    async fn failure_keeps_user_message() {
        let sessions = Arc::new(SessionStore::in_memory());
        // Nothing listens on port 9 locally.
        let agent = ChatAgent::new(
            OpenAiClient::new(Some("http://127.0.0.1:9/v1".into()), None),
            Some("m".into()),
            sessions.clone(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = agent
            .invoke("k", &text_envelope("u1", "hello"), &TokenSink::new(tx), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        let history = sessions.history("k").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let agent = ChatAgent::new(
            OpenAiClient::new(Some("http://127.0.0.1:9/v1".into()), None),
            Some("m".into()),
            Arc::new(SessionStore::in_memory()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = agent
            .invoke("k", &text_envelope("u1", "x"), &TokenSink::new(tx), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
