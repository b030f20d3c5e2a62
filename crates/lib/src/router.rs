//! Agent session router: envelope -> session key -> runtime invocation -> output stream.

use crate::agent::{AgentError, AgentRuntime, OutputUnit, TokenSink};
use crate::config::{AgentsConfig, SessionMode};
use crate::envelope::MessageEnvelope;
use crate::session::SessionKey;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reported when the runtime task stops without a terminal unit (panic or abort).
pub const RUNTIME_ENDED_UNEXPECTEDLY: &str = "agent runtime ended unexpectedly";

/// Output of one invocation: tokens in production order, then exactly one `Done` or `Failed`.
/// Yields nothing after the terminal unit.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputUnit>,
    finished: bool,
}

impl OutputStream {
    fn new(rx: mpsc::UnboundedReceiver<OutputUnit>) -> Self {
        Self { rx, finished: false }
    }

    pub async fn next(&mut self) -> Option<OutputUnit> {
        if self.finished {
            return None;
        }
        let unit = self
            .rx
            .recv()
            .await
            .unwrap_or_else(|| OutputUnit::Failed(RUNTIME_ENDED_UNEXPECTEDLY.to_string()));
        if unit.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Some(unit)
    }
}

/// Maps envelopes to session keys and runs the agent for each on its own task.
#[derive(Clone)]
pub struct SessionRouter {
    runtime: Arc<dyn AgentRuntime>,
    mode: SessionMode,
    shared_key: SessionKey,
}

impl SessionRouter {
    pub fn new(runtime: Arc<dyn AgentRuntime>, mode: SessionMode, shared_key: impl Into<SessionKey>) -> Self {
        Self {
            runtime,
            mode,
            shared_key: shared_key.into(),
        }
    }

    pub fn from_config(runtime: Arc<dyn AgentRuntime>, agents: &AgentsConfig) -> Self {
        Self::new(runtime, agents.session_mode, agents.session_key.clone())
    }

    /// Shared mode: the configured key for everyone. Per-client mode: the client id.
    pub fn session_key_for(&self, envelope: &MessageEnvelope) -> SessionKey {
        match self.mode {
            SessionMode::Shared => self.shared_key.clone(),
            SessionMode::PerClient => envelope.client_id().to_string(),
        }
    }

    /// Spawn the runtime for `envelope` and return its output. Does not wait for the first token.
    pub fn route(&self, envelope: MessageEnvelope, cancel: CancellationToken) -> OutputStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = self.session_key_for(&envelope);
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let sink = TokenSink::new(tx.clone());
            log::debug!("router: invoking runtime for {} under session {}", envelope.client_id(), key);
            let terminal = match runtime.invoke(&key, &envelope, &sink, cancel).await {
                Ok(()) => OutputUnit::Done,
                Err(AgentError::Cancelled) => {
                    log::debug!("router: invocation for {} cancelled", envelope.client_id());
                    OutputUnit::Failed(AgentError::Cancelled.to_string())
                }
                Err(e) => {
                    log::warn!("router: runtime failed for {}: {}", envelope.client_id(), e);
                    OutputUnit::Failed(e.to_string())
                }
            };
            let _ = tx.send(terminal);
        });
        OutputStream::new(rx)
    }
}
