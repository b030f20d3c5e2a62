//! Transcribe, label unknown speakers, and format the transcript text.

use super::{
    AudioClip, AudioError, AudioProcessor, SpeakerIdentifier, Transcriber, Utterance, PCM_BYTES_PER_MS,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Appended when the transcriber fails.
pub const RECOGNITION_FAILED: &str = "\n[audio transcript: recognition failed]";

/// Appended when audio arrives but no transcriber is configured.
pub const TRANSCRIPTION_UNAVAILABLE: &str = "\n[audio transcript: transcription not configured]";

/// Transcriber plus optional speaker identification and clip archiving.
pub struct AudioPipeline {
    transcriber: Arc<dyn Transcriber>,
    identifier: Option<Arc<dyn SpeakerIdentifier>>,
    save_dir: Option<PathBuf>,
    min_enroll_ms: u64,
}

impl AudioPipeline {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            identifier: None,
            save_dir: None,
            min_enroll_ms: 10_000,
        }
    }

    pub fn with_identifier(mut self, identifier: Arc<dyn SpeakerIdentifier>) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn with_save_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.save_dir = dir;
        self
    }

    pub fn with_min_enroll_ms(mut self, ms: u64) -> Self {
        self.min_enroll_ms = ms;
        self
    }

    /// Label for every speaker the service did not match to a voiceprint.
    async fn label_unknown_speakers(
        &self,
        clip: &AudioClip,
        utterances: &[Utterance],
    ) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        let mut unknown: Vec<&str> = utterances
            .iter()
            .filter(|u| u.feature_id.is_none())
            .map(|u| u.speaker.as_str())
            .collect();
        unknown.sort();
        unknown.dedup();

        let pcm = clip.pcm();
        for speaker in unknown {
            let fallback = format!("unknown speaker {}", speaker);
            let mut speech = Vec::new();
            let mut total_ms = 0u64;
            for u in utterances.iter().filter(|u| u.speaker == speaker) {
                let segment = extract_segment(pcm, u.start_ms, u.end_ms);
                if !segment.is_empty() {
                    speech.extend_from_slice(segment);
                    total_ms += u.end_ms.saturating_sub(u.start_ms);
                }
            }
            let label = match self.identifier.as_ref() {
                Some(identifier) if total_ms >= self.min_enroll_ms => {
                    match identifier.identify(&speech).await {
                        Ok(Some(id)) => {
                            log::info!("audio: speaker {} identified as {}", speaker, id);
                            id
                        }
                        Ok(None) => fallback,
                        Err(e) => {
                            log::warn!("audio: speaker identification failed for {}: {}", speaker, e);
                            fallback
                        }
                    }
                }
                Some(_) => {
                    log::debug!(
                        "audio: speaker {} has {}ms of speech, below enrollment threshold",
                        speaker,
                        total_ms
                    );
                    fallback
                }
                None => fallback,
            };
            labels.insert(speaker.to_string(), label);
        }
        labels
    }
}

/// Write the clip under `dir` as `<client>_<timestamp>_<id>.wav`.
async fn save_clip(dir: &Path, client_id: &str, clip: &AudioClip) -> Result<PathBuf, AudioError> {
    tokio::fs::create_dir_all(dir).await?;
    let safe_client: String = client_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let path = dir.join(format!("{}_{}_{}.wav", safe_client, stamp, &suffix[..8]));
    tokio::fs::write(&path, clip.bytes()).await?;
    Ok(path)
}

#[async_trait]
impl AudioProcessor for AudioPipeline {
    async fn process(&self, client_id: &str, clip: &AudioClip) -> Result<String, AudioError> {
        if let Some(ref dir) = self.save_dir {
            match save_clip(dir, client_id, clip).await {
                Ok(path) => log::info!("audio: saved clip to {}", path.display()),
                Err(e) => log::warn!("audio: saving clip failed: {}", e),
            }
        }
        let transcript = self.transcriber.transcribe(clip).await?;
        if transcript.utterances.is_empty() {
            return Ok(format!("\n[audio transcript: {}]", transcript.text));
        }
        let labels = self.label_unknown_speakers(clip, &transcript.utterances).await;
        log::info!(
            "audio: transcribed {} utterance(s), {} unmatched speaker(s)",
            transcript.utterances.len(),
            labels.len()
        );
        Ok(format_transcript(&transcript.utterances, &labels))
    }
}

/// PCM bytes covering `[start_ms, end_ms)`, clamped to the clip. Empty when the start lies past the end.
pub fn extract_segment(pcm: &[u8], start_ms: u64, end_ms: u64) -> &[u8] {
    let start = (start_ms as usize).saturating_mul(PCM_BYTES_PER_MS);
    let end = (end_ms as usize).saturating_mul(PCM_BYTES_PER_MS).min(pcm.len());
    if start >= pcm.len() || start >= end {
        return &[];
    }
    &pcm[start..end]
}

/// Speaker-tagged transcript: a new `[label]: ` line whenever the speaker changes.
/// Matched voiceprints use their feature id; others use `labels`, then `speaker <id>`.
pub fn format_transcript(utterances: &[Utterance], labels: &HashMap<String, String>) -> String {
    let mut out = String::from("\n[audio transcript:\n");
    let mut current: Option<&str> = None;
    for u in utterances {
        if current != Some(u.speaker.as_str()) {
            let label = match (&u.feature_id, labels.get(&u.speaker)) {
                (Some(feature), _) => feature.clone(),
                (None, Some(label)) => label.clone(),
                (None, None) => format!("speaker {}", u.speaker),
            };
            out.push_str("\n[");
            out.push_str(&label);
            out.push_str("]: ");
            current = Some(u.speaker.as_str());
        }
        out.push_str(&u.text);
    }
    out.push_str("\n]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Transcript;
    use std::sync::Mutex;

    fn utterance(speaker: &str, start_ms: u64, end_ms: u64, text: &str, feature: Option<&str>) -> Utterance {
        Utterance {
            speaker: speaker.to_string(),
            start_ms,
            end_ms,
            text: text.to_string(),
            feature_id: feature.map(String::from),
        }
    }

    struct FixedTranscriber(Transcript);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _clip: &AudioClip) -> Result<Transcript, AudioError> {
            Ok(self.0.clone())
        }
    }

    struct FailingTranscriber;

    #[async_trait]
    impl Transcriber for FailingTranscriber {
        async fn transcribe(&self, _clip: &AudioClip) -> Result<Transcript, AudioError> {
            Err(AudioError::Api("503 unavailable".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingIdentifier {
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SpeakerIdentifier for RecordingIdentifier {
        async fn identify(&self, pcm: &[u8]) -> Result<Option<String>, AudioError> {
            self.seen.lock().unwrap().push(pcm.len());
            Ok(Some("enrolled-7".to_string()))
        }
    }

    #[test]
    fn extract_segment_clamps() {
        let pcm: Vec<u8> = (0..100).collect();
        assert_eq!(extract_segment(&pcm, 0, 1).len(), 32);
        assert_eq!(extract_segment(&pcm, 2, 10), &pcm[64..100]);
        assert!(extract_segment(&pcm, 4, 5).is_empty());
        assert!(extract_segment(&pcm, 2, 2).is_empty());
    }

    #[test]
    fn format_switches_lines_on_speaker_change() {
        let utterances = vec![
            utterance("0", 0, 10, "hello ", Some("alice")),
            utterance("0", 10, 20, "there", Some("alice")),
            utterance("1", 20, 30, "hi", None),
            utterance("2", 30, 40, "yo", None),
        ];
        let mut labels = HashMap::new();
        labels.insert("1".to_string(), "unknown speaker 1".to_string());
        let text = format_transcript(&utterances, &labels);
        assert_eq!(
            text,
            "\n[audio transcript:\n\n[alice]: hello there\n[unknown speaker 1]: hi\n[speaker 2]: yo\n]"
        );
    }

    #[tokio::test]
    async fn no_utterances_yields_plain_text() {
        let pipeline = AudioPipeline::new(Arc::new(FixedTranscriber(Transcript {
            text: "just words".to_string(),
            utterances: vec![],
        })));
        let out = pipeline.process("u1", &AudioClip::new(vec![0; 64])).await.unwrap();
        assert_eq!(out, "\n[audio transcript: just words]");
    }

    #[tokio::test]
    async fn transcriber_failure_propagates() {
        let pipeline = AudioPipeline::new(Arc::new(FailingTranscriber));
        assert!(pipeline.process("u1", &AudioClip::new(vec![])).await.is_err());
    }

    #[tokio::test]
    async fn long_unknown_speaker_is_identified() {
        let identifier = Arc::new(RecordingIdentifier::default());
        let pipeline = AudioPipeline::new(Arc::new(FixedTranscriber(Transcript {
            text: "a b".to_string(),
            utterances: vec![
                utterance("S0", 0, 2, "a", None),
                utterance("S1", 2, 3, "b", None),
                utterance("S0", 3, 4, "c", None),
            ],
        })))
        .with_identifier(identifier.clone())
        .with_min_enroll_ms(3);
        let out = pipeline
            .process("u1", &AudioClip::new(vec![0; 32 * 4]))
            .await
            .unwrap();
        assert!(out.contains("[enrolled-7]: a"));
        assert!(out.contains("[unknown speaker S1]: b"));
        assert_eq!(*identifier.seen.lock().unwrap(), vec![32 * 3]);
    }

    #[tokio::test]
    async fn clip_is_saved_when_configured() {
        let dir = std::env::temp_dir().join(format!("newbot-audio-{}", uuid::Uuid::new_v4()));
        let pipeline = AudioPipeline::new(Arc::new(FixedTranscriber(Transcript::default())))
            .with_save_dir(Some(dir.clone()));
        pipeline
            .process("../evil/u1", &AudioClip::new(vec![1, 2, 3]))
            .await
            .unwrap();
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name().into_string().unwrap();
        assert!(name.starts_with("___evil_u1_"));
        assert!(name.ends_with(".wav"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
