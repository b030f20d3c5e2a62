//! Audio handling for inbound messages: decode, transcribe with speaker labels, format.
//!
//! Transcription and speaker identification are external services reached through
//! the [`Transcriber`] and [`SpeakerIdentifier`] traits. [`AudioPipeline`] combines them
//! into the [`AudioProcessor`] the normalizer calls.

mod diarization;
mod pipeline;
mod voiceprint;

pub use diarization::DiarizationClient;
pub use voiceprint::{VoiceprintClient, VoiceprintEntry, VoiceprintStore};
pub use pipeline::{
    extract_segment, format_transcript, AudioPipeline, RECOGNITION_FAILED, TRANSCRIPTION_UNAVAILABLE,
};

use async_trait::async_trait;
use base64::Engine;

/// 16 kHz, 16-bit mono PCM.
pub const PCM_BYTES_PER_MS: usize = 32;

const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("transcription request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transcription api error: {0}")]
    Api(String),
    #[error("audio io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded audio attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    bytes: Vec<u8>,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        Ok(Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw PCM: the clip without its WAV header when it carries one.
    pub fn pcm(&self) -> &[u8] {
        if self.bytes.starts_with(b"RIFF") && self.bytes.len() >= WAV_HEADER_LEN {
            &self.bytes[WAV_HEADER_LEN..]
        } else {
            &self.bytes
        }
    }
}

/// One speaker-attributed stretch of speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Diarization label local to this clip (e.g. "SPEAKER_00").
    pub speaker: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Enrolled voiceprint id when the service matched the speaker.
    pub feature_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub utterances: Vec<Utterance>,
}

/// Speech-to-text with speaker segmentation.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip) -> Result<Transcript, AudioError>;
}

/// Maps a speaker's accumulated PCM to a stable speaker label (enrolling it if needed).
#[async_trait]
pub trait SpeakerIdentifier: Send + Sync {
    async fn identify(&self, pcm: &[u8]) -> Result<Option<String>, AudioError>;
}

/// Turns an audio clip into the transcript text appended to a message.
#[async_trait]
pub trait AudioProcessor: Send + Sync {
    async fn process(&self, client_id: &str, clip: &AudioClip) -> Result<String, AudioError>;
}
