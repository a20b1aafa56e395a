//! Static registry of the functions offered to the language model.

use super::{Integration, ToolKind};
use anyhow::Result;
use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, FunctionObjectArgs};
use schemars::{JsonSchema, Schema};
use serde::Deserialize;

// --- Argument records ---

/// Arguments for `create_calendar_event`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateCalendarEventArgs {
    /// Short title of the event.
    pub title: String,
    /// Start time as an RFC 3339 timestamp, e.g. 2025-03-14T15:00:00Z.
    pub start: String,
    /// Optional end time as an RFC 3339 timestamp. Defaults to one hour after start.
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Email addresses of people to invite.
    #[serde(default)]
    pub attendees: Vec<String>,
}

/// Arguments for `list_upcoming_events`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListEventsArgs {
    /// How many days ahead to look (1-30). Defaults to 7.
    #[serde(default)]
    pub days_ahead: Option<u32>,
}

/// Arguments for `create_task`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskArgs {
    pub title: String,
    /// Optional due time as an RFC 3339 timestamp.
    #[serde(default)]
    pub due: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Arguments for `list_tasks`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListTasksArgs {
    /// Include tasks that are already done.
    #[serde(default)]
    pub include_completed: bool,
}

/// Arguments for `complete_task`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteTaskArgs {
    /// The title, or part of it, of the task to mark as done.
    pub title: String,
}

/// Arguments for `play_music`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlayMusicArgs {
    /// A song, artist, album, playlist or mood to play.
    pub query: String,
}

/// Arguments for `list_unread_emails`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListEmailsArgs {
    /// Maximum number of messages (1-20). Defaults to 5.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Arguments for `send_email`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendEmailArgs {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Arguments for `get_productivity_summary`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ProductivitySummaryArgs {
    /// Either "today" or "week". Defaults to "today".
    #[serde(default)]
    pub range: Option<String>,
}

/// Arguments for `start_focus_session`.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct StartFocusArgs {
    /// Length of the focus block in minutes (5-180). Defaults to 25.
    #[serde(default)]
    pub minutes: Option<u32>,
}

/// Arguments for `web_search`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    pub query: String,
    /// Maximum number of results (1-10). Defaults to 5.
    #[serde(default)]
    pub limit: Option<u32>,
}

/// For functions without parameters.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoArgs {}

// --- Registry ---

/// One function the model may call.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Verb phrase used in summaries and suggestions ("I couldn't <label>").
    pub label: &'static str,
    pub integration: Integration,
    pub kind: ToolKind,
    schema: fn() -> Schema,
}

impl ToolSpec {
    pub fn parameters(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value((self.schema)())?;
        if let Some(object) = value.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }
        Ok(value)
    }

    pub fn to_openai_tool(&self) -> Result<ChatCompletionTool> {
        Ok(ChatCompletionToolArgs::default()
            .function(
                FunctionObjectArgs::default()
                    .name(self.name)
                    .description(self.description)
                    .parameters(self.parameters()?)
                    .build()?,
            )
            .build()?)
    }
}

fn schema_of<T: JsonSchema>() -> Schema {
    schemars::schema_for!(T)
}

pub const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "create_calendar_event",
        description: "Create an event in the user's calendar.",
        label: "create the calendar event",
        integration: Integration::Calendar,
        kind: ToolKind::Action,
        schema: schema_of::<CreateCalendarEventArgs>,
    },
    ToolSpec {
        name: "list_upcoming_events",
        description: "List the user's upcoming calendar events.",
        label: "check your calendar",
        integration: Integration::Calendar,
        kind: ToolKind::Retrieval,
        schema: schema_of::<ListEventsArgs>,
    },
    ToolSpec {
        name: "create_task",
        description: "Add a task to the user's task list.",
        label: "add the task",
        integration: Integration::Tasks,
        kind: ToolKind::Action,
        schema: schema_of::<CreateTaskArgs>,
    },
    ToolSpec {
        name: "list_tasks",
        description: "List the user's tasks.",
        label: "check your tasks",
        integration: Integration::Tasks,
        kind: ToolKind::Retrieval,
        schema: schema_of::<ListTasksArgs>,
    },
    ToolSpec {
        name: "complete_task",
        description: "Mark one of the user's tasks as done.",
        label: "complete the task",
        integration: Integration::Tasks,
        kind: ToolKind::Action,
        schema: schema_of::<CompleteTaskArgs>,
    },
    ToolSpec {
        name: "play_music",
        description: "Start playing music matching a query.",
        label: "play music",
        integration: Integration::Music,
        kind: ToolKind::Action,
        schema: schema_of::<PlayMusicArgs>,
    },
    ToolSpec {
        name: "pause_music",
        description: "Pause the music that is currently playing.",
        label: "pause the music",
        integration: Integration::Music,
        kind: ToolKind::Action,
        schema: schema_of::<NoArgs>,
    },
    ToolSpec {
        name: "skip_track",
        description: "Skip to the next track.",
        label: "skip the track",
        integration: Integration::Music,
        kind: ToolKind::Action,
        schema: schema_of::<NoArgs>,
    },
    ToolSpec {
        name: "now_playing",
        description: "Report what music is currently playing.",
        label: "see what's playing",
        integration: Integration::Music,
        kind: ToolKind::Retrieval,
        schema: schema_of::<NoArgs>,
    },
    ToolSpec {
        name: "list_unread_emails",
        description: "List the user's unread emails.",
        label: "check your email",
        integration: Integration::Email,
        kind: ToolKind::Retrieval,
        schema: schema_of::<ListEmailsArgs>,
    },
    ToolSpec {
        name: "send_email",
        description: "Send an email on the user's behalf.",
        label: "send the email",
        integration: Integration::Email,
        kind: ToolKind::Action,
        schema: schema_of::<SendEmailArgs>,
    },
    ToolSpec {
        name: "get_productivity_summary",
        description: "Summarize the user's focused and distracted time.",
        label: "check your productivity",
        integration: Integration::Productivity,
        kind: ToolKind::Retrieval,
        schema: schema_of::<ProductivitySummaryArgs>,
    },
    ToolSpec {
        name: "start_focus_session",
        description: "Start a focus session that blocks distractions.",
        label: "start a focus session",
        integration: Integration::Productivity,
        kind: ToolKind::Action,
        schema: schema_of::<StartFocusArgs>,
    },
    ToolSpec {
        name: "web_search",
        description: "Search the web for current information.",
        label: "search the web",
        integration: Integration::WebSearch,
        kind: ToolKind::Retrieval,
        schema: schema_of::<WebSearchArgs>,
    },
];

pub fn lookup(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// The tool catalog restricted to integrations available for this user.
pub fn tools_for(available: &[Integration]) -> Result<Vec<ChatCompletionTool>> {
    CATALOG
        .iter()
        .filter(|spec| available.contains(&spec.integration))
        .map(ToolSpec::to_openai_tool)
        .collect()
}
