//! Audio Ingest Pipeline
//!
//! Fragments accumulate untouched until the client commits them. A commit
//! drains the buffer whatever the outcome, checks the utterance size, wraps raw
//! PCM in a WAV container and only then calls the transcription service. The
//! transcript is screened by the noise filter before it becomes a turn.

use super::protocol::InputAudioFormat;
use crate::audio_utils;
use companion_core::filters::NoiseFilter;
use companion_core::retry::RetryPolicy;
use companion_core::speech::Transcriber;
use std::mem;
use tracing::{debug, info};

/// One piece of streamed audio as it arrived on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Base64(String),
    Raw(Vec<u8>),
}

impl Fragment {
    /// Decoded size, estimated for base64 without decoding.
    fn approx_len(&self) -> usize {
        match self {
            Fragment::Base64(text) => text.len() / 4 * 3,
            Fragment::Raw(bytes) => bytes.len(),
        }
    }
}

/// Why an utterance never became a turn.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioRejected {
    #[error("no audio was received")]
    Empty,
    #[error("the recording was too short ({bytes} bytes, at least {min} needed)")]
    TooShort { bytes: usize, min: usize },
    #[error("the recording was too long ({bytes} bytes, at most {max} allowed)")]
    TooLong { bytes: usize, max: usize },
    #[error("the audio could not be decoded: {0}")]
    Undecodable(String),
    #[error("the recording was silent")]
    Silent,
    #[error("the transcript carried no usable speech")]
    LowInformation,
}

impl AudioRejected {
    /// Oversized input is a client error rather than something to repeat.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, AudioRejected::TooLong { .. } | AudioRejected::Undecodable(_))
    }
}

#[derive(Debug, Default)]
pub struct AudioBuffer {
    fragments: Vec<Fragment>,
    approx_bytes: usize,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment, clearing the buffer if it grows past `max` bytes.
    pub fn push(&mut self, fragment: Fragment, max: usize) -> Result<(), AudioRejected> {
        self.approx_bytes += fragment.approx_len();
        self.fragments.push(fragment);
        if self.approx_bytes > max {
            let bytes = self.approx_bytes;
            self.clear();
            return Err(AudioRejected::TooLong { bytes, max });
        }
        Ok(())
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.approx_bytes = 0;
    }

    /// Drains the buffer and returns the decoded utterance.
    ///
    /// The buffer is empty afterwards on every path.
    pub fn commit(&mut self, min: usize, max: usize) -> Result<Vec<u8>, AudioRejected> {
        let fragments = mem::take(&mut self.fragments);
        self.approx_bytes = 0;
        if fragments.is_empty() {
            return Err(AudioRejected::Empty);
        }

        let mut audio = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Raw(bytes) => audio.extend_from_slice(&bytes),
                Fragment::Base64(text) => {
                    let bytes = audio_utils::decode_base64(&text)
                        .map_err(|e| AudioRejected::Undecodable(e.to_string()))?;
                    audio.extend_from_slice(&bytes);
                }
            }
        }

        if audio.len() < min {
            return Err(AudioRejected::TooShort {
                bytes: audio.len(),
                min,
            });
        }
        if audio.len() > max {
            return Err(AudioRejected::TooLong {
                bytes: audio.len(),
                max,
            });
        }
        Ok(audio)
    }
}

/// Settings that shape one commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitSettings {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub format: InputAudioFormat,
    pub sample_rate: u32,
    pub silence_threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Accepted(String),
    Rejected(AudioRejected),
}

/// Runs the whole commit procedure. `Err` means transcription itself failed.
pub async fn commit_utterance(
    buffer: &mut AudioBuffer,
    settings: CommitSettings,
    transcriber: &dyn Transcriber,
    noise: &NoiseFilter,
    retry: &RetryPolicy,
) -> anyhow::Result<CommitOutcome> {
    let audio = match buffer.commit(settings.min_bytes, settings.max_bytes) {
        Ok(audio) => audio,
        Err(rejected) => {
            info!(reason = %rejected, "Audio commit rejected before transcription");
            return Ok(CommitOutcome::Rejected(rejected));
        }
    };

    let payload = match settings.format {
        InputAudioFormat::Pcm16 => {
            let energy = audio_utils::rms_energy(&audio);
            if energy < settings.silence_threshold {
                debug!(energy, "Audio commit is silent");
                return Ok(CommitOutcome::Rejected(AudioRejected::Silent));
            }
            audio_utils::pcm16_to_wav(&audio, settings.sample_rate)?
        }
        InputAudioFormat::Wav | InputAudioFormat::Webm => audio,
    };

    debug!(bytes = payload.len(), "Sending utterance to transcription");
    let filename = settings.format.filename();
    let transcript = retry
        .run("transcription", || transcriber.transcribe(payload.clone(), filename))
        .await?;

    if noise.is_low_information(&transcript) {
        info!(transcript = %transcript, "Discarding low-information transcript");
        return Ok(CommitOutcome::Rejected(AudioRejected::LowInformation));
    }
    Ok(CommitOutcome::Accepted(transcript.trim().to_string()))
}
