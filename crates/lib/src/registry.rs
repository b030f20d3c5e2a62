//! Connection registry: client id -> live transport handle.
//!
//! At most one live handle per client id. The first registrant wins until it
//! disconnects; later connections under the same id are refused. All
//! operations take the same lock, so a disconnect can never race a directed send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Opaque, caller-supplied client identifier (the `{client_id}` in `/ws/{client_id}`).
pub type ClientId = String;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("client already connected: {0}")]
    DuplicateClient(ClientId),
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("delivery failed: {0}")]
    DeliveryFailed(ClientId),
}

/// Sending side of one connection's outbound queue. The connection's writer task
/// drains the receiver onto the socket in FIFO order.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    serial: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    /// New handle plus the receiver the writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (handle, rx)
    }

    /// Unique per connection; distinguishes a reconnect from the connection it replaced.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// True once the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, content: String) -> bool {
        self.tx.send(content).is_ok()
    }
}

/// Registry of connected clients. Shared by the WebSocket handlers and the directed-send endpoint.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ClientId, ClientHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `handle` under `client_id`. Fails with `DuplicateClient` while another live handle holds the id.
    /// A stale entry whose writer already closed is replaced.
    pub async fn register(&self, client_id: &str, handle: ClientHandle) -> Result<(), RegistryError> {
        let mut g = self.inner.lock().await;
        if let Some(existing) = g.get(client_id) {
            if !existing.is_closed() {
                return Err(RegistryError::DuplicateClient(client_id.to_string()));
            }
            log::debug!("registry: replacing closed handle for {}", client_id);
        }
        g.insert(client_id.to_string(), handle);
        Ok(())
    }

    /// Remove the mapping if present. Idempotent.
    pub async fn unregister(&self, client_id: &str) {
        self.inner.lock().await.remove(client_id);
    }

    /// Remove the mapping only if it still belongs to `handle`. Returns true when removed.
    pub async fn release(&self, client_id: &str, handle: &ClientHandle) -> bool {
        let mut g = self.inner.lock().await;
        match g.get(client_id) {
            Some(current) if current.serial == handle.serial => {
                g.remove(client_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the currently registered ids (sorted; callers should not depend on order).
    pub async fn list_ids(&self) -> Vec<ClientId> {
        let g = self.inner.lock().await;
        let mut ids: Vec<ClientId> = g.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner.lock().await.contains_key(client_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queue `content` on the client's handle. A closed handle is unregistered and reported as `DeliveryFailed`.
    pub async fn send_to(&self, client_id: &str, content: impl Into<String>) -> Result<(), RegistryError> {
        let mut g = self.inner.lock().await;
        let handle = g
            .get(client_id)
            .ok_or_else(|| RegistryError::UnknownClient(client_id.to_string()))?;
        if handle.deliver(content.into()) {
            Ok(())
        } else {
            g.remove(client_id);
            log::debug!("registry: handle for {} closed during send, unregistered", client_id);
            Err(RegistryError::DeliveryFailed(client_id.to_string()))
        }
    }
}
