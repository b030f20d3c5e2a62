//! Transcriber backed by an OpenAI-compatible `/audio/diarizations` endpoint.

use super::{AudioClip, AudioError, Transcriber, Transcript, Utterance, VoiceprintStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Client for a diarization-capable speech server.
#[derive(Clone)]
pub struct DiarizationClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    voiceprints: Option<Arc<VoiceprintStore>>,
}

#[derive(Debug, Serialize)]
struct DiarizationRequest<'a> {
    audio_base64: String,
    response_format: &'a str,
    /// Comma-separated enrolled voiceprints the server may match speakers against.
    #[serde(skip_serializing_if = "Option::is_none")]
    feature_ids: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiarizationResponse {
    #[serde(default)]
    utterances: Vec<WireUtterance>,
    #[serde(default)]
    asr_text: String,
    #[serde(default)]
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct WireUtterance {
    speaker: String,
    start: f32,
    end: f32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    feature_id: Option<String>,
}

fn seconds_to_ms(s: f32) -> u64 {
    if s <= 0.0 {
        0
    } else {
        (s * 1000.0).round() as u64
    }
}

impl From<DiarizationResponse> for Transcript {
    fn from(res: DiarizationResponse) -> Self {
        let text = if res.asr_text.trim().is_empty() {
            res.transcript
        } else {
            res.asr_text
        };
        let utterances = res
            .utterances
            .into_iter()
            .map(|u| Utterance {
                speaker: u.speaker,
                start_ms: seconds_to_ms(u.start),
                end_ms: seconds_to_ms(u.end),
                text: u.text,
                feature_id: u.feature_id.filter(|f| !f.trim().is_empty()),
            })
            .collect();
        Transcript { text, utterances }
    }
}

impl DiarizationClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
            voiceprints: None,
        }
    }

    /// Send the store's enrolled feature ids with every request.
    pub fn with_voiceprints(mut self, store: Arc<VoiceprintStore>) -> Self {
        self.voiceprints = Some(store);
        self
    }

    async fn request_body(&self, clip: &AudioClip) -> DiarizationRequest<'static> {
        let feature_ids = match self.voiceprints {
            Some(ref store) => {
                let ids = store.feature_ids().await;
                (!ids.is_empty()).then(|| ids.join(","))
            }
            None => None,
        };
        DiarizationRequest {
            audio_base64: clip.to_base64(),
            response_format: "verbose_json",
            feature_ids,
        }
    }
}

#[async_trait]
impl Transcriber for DiarizationClient {
    /// POST /audio/diarizations with the clip as base64; reads utterances from verbose_json.
    async fn transcribe(&self, clip: &AudioClip) -> Result<Transcript, AudioError> {
        let url = format!("{}/audio/diarizations", self.base_url);
        let body = self.request_body(clip).await;
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
        let data: DiarizationResponse = res.json().await?;
        Ok(data.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_response_maps_to_transcript() {
        let raw = r#"{
            "segments": [],
            "utterances": [
                { "speaker": "SPEAKER_00", "start": 0.0, "end": 1.25, "text": "hello", "word_start": 0, "word_end": 1 },
                { "speaker": "SPEAKER_01", "start": 1.25, "end": 2.5, "text": "hi", "feature_id": "" }
            ],
            "asr_text": "hello hi",
            "transcript": "SPEAKER_00: hello\nSPEAKER_01: hi"
        }"#;
        let res: DiarizationResponse = serde_json::from_str(raw).unwrap();
        let t: Transcript = res.into();
        assert_eq!(t.text, "hello hi");
        assert_eq!(t.utterances.len(), 2);
        assert_eq!(t.utterances[0].end_ms, 1250);
        assert_eq!(t.utterances[1].start_ms, 1250);
        assert_eq!(t.utterances[1].feature_id, None);
    }

    #[tokio::test]
    async fn enrolled_feature_ids_are_sent() {
        let bare = DiarizationClient::new("http://asr.local/v1/", None);
        let body = serde_json::to_value(bare.request_body(&AudioClip::new(vec![1, 2, 3])).await).unwrap();
        assert_eq!(body["audio_base64"], "AQID");
        assert_eq!(body["response_format"], "verbose_json");
        assert!(body.get("feature_ids").is_none());

        let store = Arc::new(VoiceprintStore::in_memory());
        let client = DiarizationClient::new("http://asr.local/v1", None).with_voiceprints(store.clone());
        let body = serde_json::to_value(client.request_body(&AudioClip::new(vec![])).await).unwrap();
        assert!(body.get("feature_ids").is_none());

        for id in ["fp-b", "fp-a"] {
            let entry = crate::audio::VoiceprintEntry {
                name: id.to_string(),
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
            };
            store.insert(id, entry).await.unwrap();
        }
        let body = serde_json::to_value(client.request_body(&AudioClip::new(vec![])).await).unwrap();
        assert_eq!(body["feature_ids"], "fp-a,fp-b");
    }

    #[test]
    fn transcript_used_when_asr_text_missing() {
        let res: DiarizationResponse = serde_json::from_str(r#"{ "transcript": "only this" }"#).unwrap();
        let t: Transcript = res.into();
        assert_eq!(t.text, "only this");
        assert!(t.utterances.is_empty());
    }
}
