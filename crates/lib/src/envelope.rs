//! Inbound message normalizer: raw WebSocket frame -> [`MessageEnvelope`].
//!
//! A frame is either a JSON object `{ "text", "multimodal", "audio" }` or, when it
//! does not start with `{`, plain text. Audio is transcribed by the configured
//! [`AudioProcessor`] and appended as a final text part.

use crate::audio::{AudioClip, AudioProcessor, RECOGNITION_FAILED, TRANSCRIPTION_UNAVAILABLE};
use crate::registry::ClientId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One ordered segment of message content (OpenAI content-part shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::ImageUrl { .. } => None,
        }
    }
}

/// JSON frame body. `context` is accepted for `text` (older clients).
#[derive(Debug, Default, Deserialize)]
pub struct InboundPayload {
    #[serde(default, alias = "context")]
    pub text: Option<String>,
    #[serde(default)]
    pub multimodal: Vec<ContentPart>,
    /// Base64-encoded audio.
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

fn malformed(detail: impl Into<String>) -> NormalizeError {
    NormalizeError::MalformedPayload(detail.into())
}

/// A normalized inbound message. Immutable once built.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    client_id: ClientId,
    parts: Vec<ContentPart>,
    audio: Option<AudioClip>,
}

impl MessageEnvelope {
    pub fn new(client_id: impl Into<ClientId>, parts: Vec<ContentPart>, audio: Option<AudioClip>) -> Self {
        Self {
            client_id: client_id.into(),
            parts,
            audio,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    pub fn audio(&self) -> Option<&AudioClip> {
        self.audio.as_ref()
    }

    /// True when every part is text (the model can receive a plain string).
    pub fn is_text_only(&self) -> bool {
        self.parts.iter().all(|p| p.as_text().is_some())
    }

    /// Text parts joined with newlines (for logs and session history).
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse one frame into a payload and check its structure. Does not decode audio.
pub fn parse_frame(frame: &str) -> Result<InboundPayload, NormalizeError> {
    let payload = if frame.trim_start().starts_with('{') {
        serde_json::from_str::<InboundPayload>(frame).map_err(|e| malformed(e.to_string()))?
    } else {
        InboundPayload {
            text: Some(frame.to_string()),
            ..InboundPayload::default()
        }
    };
    let has_text = payload.text.as_deref().map_or(false, |t| !t.trim().is_empty());
    let has_audio = payload.audio.as_deref().map_or(false, |a| !a.trim().is_empty());
    if !has_text && payload.multimodal.is_empty() && !has_audio {
        return Err(malformed("message has no text, multimodal parts or audio"));
    }
    for part in &payload.multimodal {
        match part {
            ContentPart::Text { text } if text.trim().is_empty() => {
                return Err(malformed("empty text part"));
            }
            ContentPart::ImageUrl { image_url } if image_url.url.trim().is_empty() => {
                return Err(malformed("empty image_url"));
            }
            _ => {}
        }
    }
    Ok(payload)
}

/// Builds envelopes; holds the optional audio collaborator.
#[derive(Clone, Default)]
pub struct Normalizer {
    audio: Option<Arc<dyn AudioProcessor>>,
}

impl Normalizer {
    pub fn new(audio: Option<Arc<dyn AudioProcessor>>) -> Self {
        Self { audio }
    }

    /// Normalize one inbound frame from `client_id`. Parts are ordered text, multimodal, audio transcript.
    /// Transcription failures do not fail the message; a notice is appended instead.
    pub async fn normalize(&self, client_id: &str, frame: &str) -> Result<MessageEnvelope, NormalizeError> {
        let payload = parse_frame(frame)?;
        let clip = match payload.audio.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(encoded) => Some(
                AudioClip::from_base64(encoded).map_err(|e| malformed(format!("invalid audio base64: {}", e)))?,
            ),
            None => None,
        };

        let mut parts = Vec::with_capacity(payload.multimodal.len() + 2);
        if let Some(text) = payload.text.filter(|t| !t.trim().is_empty()) {
            parts.push(ContentPart::Text { text });
        }
        parts.extend(payload.multimodal);

        if let Some(ref clip) = clip {
            let transcript = match self.audio.as_ref() {
                Some(processor) => match processor.process(client_id, clip).await {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("audio processing failed for {}: {}", client_id, e);
                        RECOGNITION_FAILED.to_string()
                    }
                },
                None => {
                    log::debug!("audio received from {} but no transcriber configured", client_id);
                    TRANSCRIPTION_UNAVAILABLE.to_string()
                }
            };
            parts.push(ContentPart::Text { text: transcript });
        }

        Ok(MessageEnvelope::new(client_id, parts, clip))
    }
}
