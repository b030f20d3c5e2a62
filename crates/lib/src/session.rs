//! Conversation history keyed by session key.
//!
//! The agent runtime appends each turn here. When a state file is configured the
//! whole map is rewritten after every append, so history survives a restart.

use crate::llm::ChatMessage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Session key (opaque string). Shared by all clients unless per-client mode is on.
pub type SessionKey = String;

/// Session histories, optionally backed by a JSON file.
pub struct SessionStore {
    path: Option<PathBuf>,
    inner: RwLock<HashMap<SessionKey, Vec<ChatMessage>>>,
    /// Held across snapshot, write and rename; one save at a time.
    save_lock: Mutex<()>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SessionStore {
    /// Store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(HashMap::new()),
            save_lock: Mutex::new(()),
        }
    }

    /// Load from path; if file missing or invalid, starts empty (invalid files are logged).
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let sessions = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                log::warn!("session file {} unreadable, starting empty: {}", path.display(), e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path: Some(path),
            inner: RwLock::new(sessions),
            save_lock: Mutex::new(()),
        }
    }

    /// Full history for `key` (empty when unknown).
    pub async fn history(&self, key: &str) -> Vec<ChatMessage> {
        self.inner.read().await.get(key).cloned().unwrap_or_default()
    }

    /// Append messages to `key` and persist.
    pub async fn append(&self, key: &str, messages: Vec<ChatMessage>) -> std::io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        {
            let mut g = self.inner.write().await;
            g.entry(key.to_string()).or_default().extend(messages);
        }
        self.save().await
    }

    pub async fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.inner.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Write to a sibling temp file then rename over the target.
    /// The snapshot is taken after acquiring the save lock, so a later save never writes older state.
    async fn save(&self) -> std::io::Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let _saving = self.save_lock.lock().await;
        let json = {
            let g = self.inner.read().await;
            serde_json::to_string_pretty(&*g)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}
