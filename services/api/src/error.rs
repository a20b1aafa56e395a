//! Session error taxonomy and WebSocket close codes.

use crate::auth::AuthError;
use crate::ws::audio::AudioRejected;

/// Failures surfaced while handling one session.
///
/// Only `Authentication` terminates the connection; every other variant is
/// recovered locally and the bot returns to `idle`. Tool failures stay per
/// call as `ToolError` results inside a turn and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("{0}")]
    Validation(String),
    #[error("transcription rejected: {0}")]
    TranscriptionRejected(#[from] AudioRejected),
    #[error("upstream model error: {0}")]
    UpstreamModel(String),
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Wraps a model or request-assembly failure with its full cause chain.
    pub fn upstream(error: anyhow::Error) -> Self {
        Self::UpstreamModel(format!("{error:#}"))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    AuthenticationFailed,
    AuthenticationExpired,
    IdleTimeout,
    HeartbeatTimeout,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::AuthenticationFailed => 4001,
            CloseReason::AuthenticationExpired => 4002,
            CloseReason::IdleTimeout => 4003,
            CloseReason::HeartbeatTimeout => 4004,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::Normal => "session closed",
            CloseReason::AuthenticationFailed => "authentication failed",
            CloseReason::AuthenticationExpired => "session token expired",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
        }
    }
}
