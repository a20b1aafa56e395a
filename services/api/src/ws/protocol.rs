//! Defines the WebSocket message protocol between the client and the session engine.

use chrono::{DateTime, Utc};
use companion_core::BotState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the client encodes the audio it streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputAudioFormat {
    /// Raw little-endian 16-bit mono PCM.
    #[default]
    Pcm16,
    Wav,
    Webm,
}

impl InputAudioFormat {
    /// File name handed to the transcription service.
    pub fn filename(&self) -> &'static str {
        match self {
            InputAudioFormat::Pcm16 | InputAudioFormat::Wav => "utterance.wav",
            InputAudioFormat::Webm => "utterance.webm",
        }
    }
}

/// Options sent with `start_realtime`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConfig {
    #[serde(default)]
    pub voice: Option<String>,
    /// Format of synthesized replies. Only `mp3` is produced today.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub input_format: InputAudioFormat,
}

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replaces the session credential without reconnecting.
    RefreshToken { token: String },
    /// Enables voice replies.
    StartRealtime {
        #[serde(default)]
        config: RealtimeConfig,
    },
    /// One base64-encoded audio fragment.
    AudioChunk { audio: String },
    /// The accumulated audio forms one utterance.
    CommitAudio,
    /// A typed user turn. `id` is the client's idempotency key.
    TextMessage {
        text: String,
        #[serde(default)]
        id: Option<String>,
    },
    StopRealtime,
    /// Merges client-side context (timezone, location, ...) into the session.
    UpdateContext { context: serde_json::Value },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RefreshToken { .. } => "refresh_token",
            ClientMessage::StartRealtime { .. } => "start_realtime",
            ClientMessage::AudioChunk { .. } => "audio_chunk",
            ClientMessage::CommitAudio => "commit_audio",
            ClientMessage::TextMessage { .. } => "text_message",
            ClientMessage::StopRealtime => "stop_realtime",
            ClientMessage::UpdateContext { .. } => "update_context",
        }
    }
}

/// Kinds of server-initiated messages.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProactiveKind {
    Greeting,
    TaskReminder,
    EventReminder,
    IdleAnimation,
    BreakReminder,
    Suggestion,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        session_id: Uuid,
    },
    StateChange {
        state: BotState,
        animation: &'static str,
    },
    /// Echo of the utterance being worked on.
    Processing {
        text: String,
    },
    FunctionCall {
        function: String,
        arguments: serde_json::Value,
    },
    FunctionResult {
        function: String,
        result: String,
    },
    FunctionError {
        function: String,
        error: String,
    },
    Response {
        text: String,
        id: String,
    },
    AudioResponse {
        audio: String,
        format: String,
    },
    TokenRefreshed {
        expires_at: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    /// Autonomous message, kept apart from turn replies.
    Proactive {
        kind: ProactiveKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        animation: Option<String>,
    },
}

impl ServerMessage {
    pub fn state_change(state: BotState) -> Self {
        ServerMessage::StateChange {
            state,
            animation: state.animation(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
