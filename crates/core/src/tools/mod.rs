//! Tool Dispatch Table
//!
//! The language model may ask for named external capabilities during a turn.
//! This module owns everything between the model's request and the external
//! collaborator: the static catalog of functions, the lazily-initialized
//! per-session service handles, and the dispatcher that normalizes every
//! outcome into a short success detail or a user-safe error.

pub mod catalog;
pub mod dispatch;
pub mod handles;
pub mod http;
pub mod services;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use dispatch::dispatch;
pub use handles::{ToolHandle, ToolServiceFactory, ToolServices};

/// An external integration a user may have connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integration {
    Calendar,
    Tasks,
    Music,
    Email,
    Productivity,
    WebSearch,
}

impl Integration {
    pub const ALL: [Integration; 6] = [
        Integration::Calendar,
        Integration::Tasks,
        Integration::Music,
        Integration::Email,
        Integration::Productivity,
        Integration::WebSearch,
    ];

    /// Stable key used in storage and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Integration::Calendar => "calendar",
            Integration::Tasks => "tasks",
            Integration::Music => "music",
            Integration::Email => "email",
            Integration::Productivity => "productivity",
            Integration::WebSearch => "web_search",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Integration::Calendar => "Your calendar",
            Integration::Tasks => "Your task list",
            Integration::Music => "Your music player",
            Integration::Email => "Your email",
            Integration::Productivity => "Your productivity tracker",
            Integration::WebSearch => "Web search",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_str() == key)
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval tools fetch information the model should narrate; action tools
/// change something and are summarized from a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Retrieval,
    Action,
}

/// A tool failure, phrased so it can be repeated to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("I don't know how to do '{0}' yet")]
    UnrecognizedFunction(String),
    #[error("the request was missing some details ({reason})")]
    InvalidArguments { function: String, reason: String },
    #[error("{} isn't connected yet, you can link it in settings", .0.display_name())]
    NotConnected(Integration),
    #[error("{0}")]
    Service(String),
    #[error("{} took too long to respond", .0.display_name())]
    Timeout(Integration),
}

/// A side effect the session should react to after a successful call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEffect {
    EventCreated {
        id: String,
        title: String,
        start: DateTime<Utc>,
    },
    TaskCreated {
        id: String,
        title: String,
        due: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSuccess {
    /// One sentence describing what happened.
    pub detail: String,
    /// Raw payload handed to the model when it narrates retrieval results.
    pub data: serde_json::Value,
    pub effect: Option<ToolEffect>,
}

impl ToolSuccess {
    pub fn new(detail: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            detail: detail.into(),
            data,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = Some(effect);
        self
    }
}

pub type ToolOutcome = Result<ToolSuccess, ToolError>;

/// One executed tool call within a turn.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn kind(&self) -> ToolKind {
        catalog::lookup(&self.tool)
            .map(|spec| spec.kind)
            .unwrap_or(ToolKind::Action)
    }

    /// Text handed back to the model as the tool message content.
    pub fn to_model_content(&self) -> String {
        let value = match &self.outcome {
            Ok(success) => serde_json::json!({
                "status": "ok",
                "detail": success.detail,
                "data": success.data,
            }),
            Err(e) => serde_json::json!({ "status": "error", "error": e.to_string() }),
        };
        value.to_string()
    }
}

/// Builds the templated summary reported after action tools.
pub fn summarize_results(results: &[ToolResult]) -> String {
    let parts: Vec<String> = results
        .iter()
        .map(|result| match &result.outcome {
            Ok(success) => success.detail.clone(),
            Err(e) => {
                let label = catalog::lookup(&result.tool)
                    .map(|spec| spec.label)
                    .unwrap_or("do that");
                format!("I couldn't {label}: {e}.")
            }
        })
        .collect();
    if parts.is_empty() {
        "Done.".to_string()
    } else {
        parts.join(" ")
    }
}
