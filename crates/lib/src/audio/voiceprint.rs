//! Voiceprint enrollment: register an unknown speaker's speech with the voiceprint
//! service and remember the returned feature id.
//!
//! Known feature ids are kept in a JSON file and passed to the transcriber on every
//! request, so enrolled speakers come back already matched.

use super::{AudioError, SpeakerIdentifier, PCM_BYTES_PER_MS};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One enrolled speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceprintEntry {
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    registered: BTreeMap<String, VoiceprintEntry>,
}

/// Enrolled feature ids, optionally backed by a JSON file.
pub struct VoiceprintStore {
    path: Option<PathBuf>,
    inner: RwLock<StoreFile>,
    save_lock: Mutex<()>,
}

impl VoiceprintStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(StoreFile::default()),
            save_lock: Mutex::new(()),
        }
    }

    /// Load from path; a missing or invalid file starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                log::warn!("voiceprint store {} unreadable, starting empty: {}", path.display(), e);
                StoreFile::default()
            }),
            Err(_) => StoreFile::default(),
        };
        Self {
            path: Some(path),
            inner: RwLock::new(data),
            save_lock: Mutex::new(()),
        }
    }

    /// Enrolled feature ids, sorted.
    pub async fn feature_ids(&self) -> Vec<String> {
        self.inner.read().await.registered.keys().cloned().collect()
    }

    pub async fn get(&self, feature_id: &str) -> Option<VoiceprintEntry> {
        self.inner.read().await.registered.get(feature_id).cloned()
    }

    /// Record a new enrollment and persist.
    pub async fn insert(&self, feature_id: &str, entry: VoiceprintEntry) -> std::io::Result<()> {
        self.inner
            .write()
            .await
            .registered
            .insert(feature_id.to_string(), entry);
        self.save().await
    }

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

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    audio_base64: String,
    audio_type: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    feature_id: Option<String>,
}

/// Enrolls speakers with a voiceprint service (`POST {base}/voiceprints/register`).
pub struct VoiceprintClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    store: Arc<VoiceprintStore>,
}

impl VoiceprintClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, store: Arc<VoiceprintStore>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<VoiceprintStore> {
        &self.store
    }

    /// Register `pcm` under `name`; returns the service's feature id.
    pub async fn register(&self, pcm: &[u8], name: &str) -> Result<String, AudioError> {
        let url = format!("{}/voiceprints/register", self.base_url);
        let body = RegisterRequest {
            audio_base64: base64::engine::general_purpose::STANDARD.encode(pcm),
            audio_type: "raw",
            name,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AudioError::Api(format!("{} {}", status, body)));
        }
        let data: RegisterResponse = res.json().await?;
        data.feature_id
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| AudioError::Api("register response has no feature_id".to_string()))
    }
}

#[async_trait]
impl SpeakerIdentifier for VoiceprintClient {
    async fn identify(&self, pcm: &[u8]) -> Result<Option<String>, AudioError> {
        if pcm.is_empty() {
            return Ok(None);
        }
        let now = chrono::Local::now();
        let name = format!("speaker_{}", now.format("%Y%m%d_%H%M%S"));
        let feature_id = self.register(pcm, &name).await?;
        log::info!(
            "voiceprint: enrolled {} ({}ms of speech) as {}",
            name,
            pcm.len() / PCM_BYTES_PER_MS,
            feature_id
        );
        let entry = VoiceprintEntry {
            name,
            created_at: now.to_rfc3339(),
        };
        if let Err(e) = self.store.insert(&feature_id, entry).await {
            log::warn!("voiceprint: saving store failed: {}", e);
        }
        Ok(Some(feature_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct FakeService {
        requests: Arc<StdMutex<Vec<Value>>>,
    }

    async fn register(State(svc): State<FakeService>, Json(body): Json<Value>) -> Json<Value> {
        svc.requests.lock().unwrap().push(body);
        Json(serde_json::json!({ "feature_id": "fp-001" }))
    }

    async fn start_fake_service() -> (String, FakeService) {
        let svc = FakeService::default();
        let app = Router::new()
            .route("/v1/voiceprints/register", post(register))
            .with_state(svc.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}/v1/", addr), svc)
    }

    fn temp_file() -> PathBuf {
        std::env::temp_dir()
            .join(format!("newbot-voiceprints-{}", uuid::Uuid::new_v4()))
            .join("voiceprints.json")
    }

    #[tokio::test]
    async fn identify_enrolls_and_remembers_feature_id() {
        let (url, svc) = start_fake_service().await;
        let path = temp_file();
        let store = Arc::new(VoiceprintStore::load(&path).await);
        let client = VoiceprintClient::new(url, Some("k".to_string()), store.clone());

        let id = client.identify(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(id.as_deref(), Some("fp-001"));
        assert_eq!(store.feature_ids().await, vec!["fp-001".to_string()]);

        let requests = svc.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["audio_base64"], "AQIDBA==");
        assert_eq!(requests[0]["audio_type"], "raw");
        assert!(requests[0]["name"].as_str().unwrap().starts_with("speaker_"));

        let reloaded = VoiceprintStore::load(&path).await;
        assert_eq!(reloaded.feature_ids().await, vec!["fp-001".to_string()]);
        assert!(reloaded.get("fp-001").await.unwrap().name.starts_with("speaker_"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn empty_speech_is_not_sent() {
        let (url, svc) = start_fake_service().await;
        let client = VoiceprintClient::new(url, None, Arc::new(VoiceprintStore::in_memory()));
        assert_eq!(client.identify(&[]).await.unwrap(), None);
        assert!(svc.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn service_error_is_reported() {
        let app = Router::new().route(
            "/voiceprints/register",
            post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let store = Arc::new(VoiceprintStore::in_memory());
        let client = VoiceprintClient::new(format!("http://{}", addr), None, store.clone());
        match client.identify(&[0; 8]).await {
            Err(AudioError::Api(msg)) => assert!(msg.contains("503"), "got {}", msg),
            other => panic!("expected api error, got {:?}", other),
        }
        assert!(store.feature_ids().await.is_empty());
    }

    #[test]
    fn response_without_feature_id_parses() {
        let res: RegisterResponse = serde_json::from_str(r#"{ "status": "ok" }"#).unwrap();
        assert!(res.feature_id.is_none());
    }
}
