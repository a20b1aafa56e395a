//! Speech collaborators
//!
//! Transcription (audio bytes → text) and synthesis (text → audio bytes) are
//! opaque external services. The traits keep the session engine independent of
//! the vendor; the OpenAI-compatible implementations back the production
//! binary.

use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        AudioInput, CreateSpeechRequestArgs, CreateTranscriptionRequestArgs, SpeechModel,
        SpeechResponseFormat, Voice,
    },
};
use async_trait::async_trait;

/// Turns a committed utterance into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `filename` carries the container extension the service should assume.
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String>;
}

/// Audio produced for a reply.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub format: String,
}

/// Turns a reply into speech.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SynthesizedAudio>;
}

pub struct OpenAITranscriber {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAITranscriber {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl Transcriber for OpenAITranscriber {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String> {
        let request = CreateTranscriptionRequestArgs::default()
            .file(AudioInput::from_vec_u8(filename.to_string(), audio))
            .model(&self.model)
            .build()?;
        let response = self
            .client
            .audio()
            .transcribe(request)
            .await
            .context("Transcription request failed")?;
        Ok(response.text.trim().to_string())
    }
}

pub struct OpenAISynthesizer {
    client: Client<OpenAIConfig>,
    default_voice: Voice,
}

impl OpenAISynthesizer {
    pub fn new(config: OpenAIConfig, default_voice: &str) -> Self {
        Self {
            client: Client::with_config(config),
            default_voice: parse_voice(default_voice).unwrap_or(Voice::Alloy),
        }
    }
}

/// Maps a voice name onto the service's voice catalogue.
pub fn parse_voice(name: &str) -> Option<Voice> {
    match name.to_lowercase().as_str() {
        "alloy" => Some(Voice::Alloy),
        "echo" => Some(Voice::Echo),
        "fable" => Some(Voice::Fable),
        "onyx" => Some(Voice::Onyx),
        "nova" => Some(Voice::Nova),
        "shimmer" => Some(Voice::Shimmer),
        _ => None,
    }
}

#[async_trait]
impl Synthesizer for OpenAISynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<SynthesizedAudio> {
        let voice = voice
            .and_then(parse_voice)
            .unwrap_or_else(|| self.default_voice.clone());
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .model(SpeechModel::Tts1)
            .voice(voice)
            .response_format(SpeechResponseFormat::Mp3)
            .build()?;
        let response = self
            .client
            .audio()
            .speech(request)
            .await
            .context("Speech synthesis request failed")?;
        Ok(SynthesizedAudio {
            bytes: response.bytes.to_vec(),
            format: "mp3".to_string(),
        })
    }
}
