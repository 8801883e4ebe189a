//! Speech-to-text for `transcribe_audio`: a `Transcriber` seam with a Deepgram client.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::{TranscriptionBackend, TranscriptionConfig};

const DEEPGRAM_LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";
const DEEPGRAM_PARAMS: [(&str, &str); 6] = [
    ("model", "nova-2"),
    ("smart_format", "true"),
    ("punctuate", "true"),
    ("utterances", "true"),
    ("diarize", "true"),
    ("language", "en"),
];

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("transcription is not configured")]
    NotConfigured,
    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),
    #[error("No speech detected")]
    NoSpeech,
    #[error("transcription api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("transcription request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw audio bytes of the given mime type.
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<String, TranscriptionError>;
}

/// Decode a base64 (or data-URI) audio payload.
pub fn decode_audio(payload: &str) -> Result<Vec<u8>, TranscriptionError> {
    let b64 = match payload.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| TranscriptionError::InvalidAudio(e.to_string()))?;
    if bytes.is_empty() {
        return Err(TranscriptionError::InvalidAudio("empty audio".to_string()));
    }
    Ok(bytes)
}

pub struct DeepgramTranscriber {
    api_key: String,
    url: String,
    client: reqwest::Client,
}

impl DeepgramTranscriber {
    pub fn new(api_key: impl Into<String>, url: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: url.unwrap_or_else(|| DEEPGRAM_LISTEN_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<String, TranscriptionError> {
        let res = self
            .client
            .post(&self.url)
            .query(&DEEPGRAM_PARAMS)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime_type)
            .body(audio)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TranscriptionError::Api { status, body });
        }
        let data: ListenResponse = res.json().await?;
        format_transcript(data)
    }
}

/// Transcriber from config; `None` when the backend is disabled or has no key.
pub fn from_config(config: &TranscriptionConfig) -> Option<Arc<dyn Transcriber>> {
    match config.backend {
        TranscriptionBackend::None => None,
        TranscriptionBackend::Deepgram => match config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Some(Arc::new(DeepgramTranscriber::new(key, None))),
            _ => {
                log::warn!("transcription: deepgram selected but no api key configured");
                None
            }
        },
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListenResponse {
    #[serde(default)]
    results: Option<ListenResults>,
}

#[derive(Debug, Default, Deserialize)]
struct ListenResults {
    #[serde(default)]
    utterances: Vec<Utterance>,
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Utterance {
    #[serde(default)]
    speaker: u32,
    #[serde(default)]
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

fn format_transcript(data: ListenResponse) -> Result<String, TranscriptionError> {
    let results = data.results.unwrap_or_default();
    let text = if results.utterances.is_empty() {
        results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default()
    } else {
        results
            .utterances
            .iter()
            .filter(|u| !u.transcript.trim().is_empty())
            .map(|u| format!("Speaker {}: {}", u.speaker, u.transcript.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    if text.trim().is_empty() {
        return Err(TranscriptionError::NoSpeech);
    }
    Ok(text)
}
