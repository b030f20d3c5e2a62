//! Audio pipeline built from config against fake diarization and voiceprint servers.

use axum::{extract::State, routing::post, Json, Router};
use newbot::audio::{AudioClip, AudioProcessor};
use newbot::config::Config;
use newbot::gateway::build_audio_processor;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct FakeSpeech {
    diarizations: Arc<Mutex<Vec<Value>>>,
    registrations: Arc<Mutex<Vec<Value>>>,
}

/// One two-second utterance; matched to `fp-1` once the client sends that id.
async fn diarize(State(fake): State<FakeSpeech>, Json(body): Json<Value>) -> Json<Value> {
    let feature_id = if body["feature_ids"].as_str() == Some("fp-1") { "fp-1" } else { "" };
    fake.diarizations.lock().unwrap().push(body);
    Json(json!({
        "utterances": [{
            "speaker": "SPEAKER_00",
            "start": 0.0,
            "end": 2.0,
            "text": "hello",
            "feature_id": feature_id
        }],
        "asr_text": "hello"
    }))
}

async fn register(State(fake): State<FakeSpeech>, Json(body): Json<Value>) -> Json<Value> {
    fake.registrations.lock().unwrap().push(body);
    Json(json!({ "feature_id": "fp-1" }))
}

async fn start_fake_speech() -> (String, FakeSpeech) {
    let fake = FakeSpeech::default();
    let app = Router::new()
        .route("/v1/audio/diarizations", post(diarize))
        .route("/v1/voiceprints/register", post(register))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}/v1", addr), fake)
}

#[tokio::test]
async fn unknown_speaker_is_enrolled_then_matched_by_id() {
    let (url, fake) = start_fake_speech().await;
    let store = std::env::temp_dir()
        .join(format!("newbot-audio-it-{}", uuid::Uuid::new_v4()))
        .join("voiceprints.json");
    let mut config = Config::default();
    config.audio.transcribe_url = Some(url.clone());
    config.audio.voiceprint_url = Some(url);
    config.audio.voiceprint_store = Some(store.clone());
    config.audio.min_enroll_ms = 1_000;

    let processor = build_audio_processor(&config).await.expect("audio configured");
    let clip = AudioClip::new(vec![0; 64_000]);

    let first = processor.process("u1", &clip).await.unwrap();
    assert!(first.contains("[fp-1]: hello"), "got {:?}", first);
    {
        let registrations = fake.registrations.lock().unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0]["audio_type"], "raw");
    }

    let second = processor.process("u1", &clip).await.unwrap();
    assert!(second.contains("[fp-1]: hello"), "got {:?}", second);
    assert_eq!(fake.registrations.lock().unwrap().len(), 1);

    let diarizations = fake.diarizations.lock().unwrap().clone();
    assert_eq!(diarizations.len(), 2);
    assert!(diarizations[0].get("feature_ids").is_none());
    assert_eq!(diarizations[1]["feature_ids"], "fp-1");

    // A restarted gateway keeps sending the enrolled id.
    let reloaded = newbot::audio::VoiceprintStore::load(&store).await;
    assert_eq!(reloaded.feature_ids().await, vec!["fp-1".to_string()]);
    let _ = std::fs::remove_dir_all(store.parent().unwrap());
}

#[tokio::test]
async fn no_transcribe_url_means_no_processor() {
    let mut config = Config::default();
    config.audio.voiceprint_url = Some("http://127.0.0.1:9/v1".to_string());
    assert!(build_audio_processor(&config).await.is_none());
}
