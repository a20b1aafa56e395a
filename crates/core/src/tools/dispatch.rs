//! Executes a single tool call against the session's service handles.

use super::catalog::{
    self, CompleteTaskArgs, CreateCalendarEventArgs, CreateTaskArgs, ListEmailsArgs,
    ListEventsArgs, ListTasksArgs, PlayMusicArgs, ProductivitySummaryArgs, SendEmailArgs,
    StartFocusArgs, WebSearchArgs,
};
use super::services::{
    NewCalendarEvent, NewTask, OutgoingEmail, ReportRange, ServiceError, Task,
};
use super::{ToolEffect, ToolError, ToolOutcome, ToolServices, ToolSuccess};
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, instrument};

/// Events starting further back than this are treated as a mistake.
const PAST_START_TOLERANCE_MINUTES: i64 = 5;

/// Runs the function `name` with the model-supplied JSON `raw_arguments`.
///
/// `now` carries the user's UTC offset: timestamps without an offset are read
/// in it and confirmations are worded in it.
///
/// Never panics or propagates: every failure is folded into the `ToolError`
/// of the returned outcome.
#[instrument(skip(services, raw_arguments), fields(user_id = %services.user_id()))]
pub async fn dispatch(
    services: &ToolServices,
    name: &str,
    raw_arguments: &str,
    now: DateTime<FixedOffset>,
) -> ToolOutcome {
    let spec =
        catalog::lookup(name).ok_or_else(|| ToolError::UnrecognizedFunction(name.to_string()))?;
    let arguments = parse_arguments(name, raw_arguments)?;
    info!(function = spec.name, "Executing tool");

    match spec.name {
        "create_calendar_event" => create_calendar_event(services, args(name, arguments)?, now).await,
        "list_upcoming_events" => list_upcoming_events(services, args(name, arguments)?, now).await,
        "create_task" => create_task(services, args(name, arguments)?, now.offset()).await,
        "list_tasks" => list_tasks(services, args(name, arguments)?, now.with_timezone(&Utc)).await,
        "complete_task" => complete_task(services, args(name, arguments)?).await,
        "play_music" => play_music(services, args(name, arguments)?).await,
        "pause_music" => pause_music(services).await,
        "skip_track" => skip_track(services).await,
        "now_playing" => now_playing(services).await,
        "list_unread_emails" => list_unread_emails(services, args(name, arguments)?).await,
        "send_email" => send_email(services, args(name, arguments)?).await,
        "get_productivity_summary" => productivity_summary(services, args(name, arguments)?).await,
        "start_focus_session" => start_focus_session(services, args(name, arguments)?).await,
        "web_search" => web_search(services, args(name, arguments)?).await,
        other => Err(ToolError::UnrecognizedFunction(other.to_string())),
    }
}

fn parse_arguments(function: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| invalid(function, format!("arguments are not valid JSON: {e}")))
}

fn args<T: DeserializeOwned>(function: &str, value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| invalid(function, e.to_string()))
}

fn invalid(function: &str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        function: function.to_string(),
        reason: reason.into(),
    }
}

fn service_error(e: ServiceError) -> ToolError {
    ToolError::Service(e.to_string())
}

fn require_text(function: &str, field: &str, value: &str) -> Result<String, ToolError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(invalid(function, format!("{field} is empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Accepts RFC 3339, or a naive timestamp read as wall-clock time in `offset`.
pub fn parse_timestamp(
    function: &str,
    field: &str,
    value: &str,
    offset: &FixedOffset,
) -> Result<DateTime<Utc>, ToolError> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| invalid(function, format!("{field} '{value}' is not a valid date and time")))
}

fn describe_time(at: DateTime<Utc>, offset: &FixedOffset) -> String {
    at.with_timezone(offset).format("%a, %b %-d at %-I:%M %p").to_string()
}

fn to_data<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// --- Calendar ---

async fn create_calendar_event(
    services: &ToolServices,
    args: CreateCalendarEventArgs,
    now: DateTime<FixedOffset>,
) -> ToolOutcome {
    const NAME: &str = "create_calendar_event";
    let offset = now.offset();
    let title = require_text(NAME, "title", &args.title)?;
    let start = parse_timestamp(NAME, "start", &args.start, offset)?;
    if start < now.with_timezone(&Utc) - Duration::minutes(PAST_START_TOLERANCE_MINUTES) {
        return Err(invalid(NAME, "the start time is in the past"));
    }
    let end = match args.end.as_deref() {
        Some(end) => parse_timestamp(NAME, "end", end, offset)?,
        None => start + Duration::hours(1),
    };
    if end <= start {
        return Err(invalid(NAME, "the event ends before it starts"));
    }

    let calendar = services.calendar().await?;
    let event = calendar
        .create_event(NewCalendarEvent {
            title,
            start,
            end,
            description: args.description,
            attendees: args.attendees,
        })
        .await
        .map_err(service_error)?;

    Ok(ToolSuccess::new(
        format!(
            "I've added \"{}\" to your calendar for {}.",
            event.title,
            describe_time(event.start, offset)
        ),
        to_data(&event),
    )
    .with_effect(ToolEffect::EventCreated {
        id: event.id,
        title: event.title,
        start: event.start,
    }))
}

async fn list_upcoming_events(
    services: &ToolServices,
    args: ListEventsArgs,
    now: DateTime<FixedOffset>,
) -> ToolOutcome {
    let offset = now.offset();
    let now = now.with_timezone(&Utc);
    let days = args.days_ahead.unwrap_or(7).clamp(1, 30);
    let calendar = services.calendar().await?;
    let events = calendar
        .list_events(now, now + Duration::days(i64::from(days)))
        .await
        .map_err(service_error)?;

    let detail = if events.is_empty() {
        format!("Your calendar is clear for the next {days} days.")
    } else {
        let listed: Vec<String> = events
            .iter()
            .take(5)
            .map(|e| format!("\"{}\" on {}", e.title, describe_time(e.start, offset)))
            .collect();
        format!("You have {} upcoming event(s): {}.", events.len(), listed.join(", "))
    };
    Ok(ToolSuccess::new(detail, to_data(&events)))
}

// --- Tasks ---

async fn create_task(
    services: &ToolServices,
    args: CreateTaskArgs,
    offset: &FixedOffset,
) -> ToolOutcome {
    const NAME: &str = "create_task";
    let title = require_text(NAME, "title", &args.title)?;
    let due = args
        .due
        .as_deref()
        .map(|due| parse_timestamp(NAME, "due", due, offset))
        .transpose()?;

    let tasks = services.tasks().await?;
    let task = tasks
        .create_task(NewTask {
            title,
            due,
            notes: args.notes,
        })
        .await
        .map_err(service_error)?;

    let detail = match task.due {
        Some(due) => format!(
            "I've added \"{}\" to your tasks, due {}.",
            task.title,
            describe_time(due, offset)
        ),
        None => format!("I've added \"{}\" to your tasks.", task.title),
    };
    Ok(ToolSuccess::new(detail, to_data(&task)).with_effect(ToolEffect::TaskCreated {
        id: task.id,
        title: task.title,
        due: task.due,
    }))
}

async fn list_tasks(services: &ToolServices, args: ListTasksArgs, now: DateTime<Utc>) -> ToolOutcome {
    let tasks = services.tasks().await?;
    let list = tasks
        .list_tasks(args.include_completed)
        .await
        .map_err(service_error)?;

    let pending: Vec<&Task> = list.iter().filter(|t| !t.completed).collect();
    let overdue = pending
        .iter()
        .filter(|t| t.due.is_some_and(|due| due < now))
        .count();
    let detail = if list.is_empty() {
        "Your task list is empty.".to_string()
    } else {
        let titles: Vec<String> = pending.iter().take(5).map(|t| format!("\"{}\"", t.title)).collect();
        format!(
            "You have {} pending task(s), {} overdue{}{}",
            pending.len(),
            overdue,
            if titles.is_empty() { "" } else { ": " },
            titles.join(", ")
        ) + "."
    };
    Ok(ToolSuccess::new(detail, to_data(&list)))
}

async fn complete_task(services: &ToolServices, args: CompleteTaskArgs) -> ToolOutcome {
    const NAME: &str = "complete_task";
    let query = require_text(NAME, "title", &args.title)?;
    let tasks = services.tasks().await?;
    let pending = tasks.list_tasks(false).await.map_err(service_error)?;

    let best = best_task_match(&pending, &query).ok_or_else(|| {
        ToolError::Service(format!("I couldn't find a task matching \"{query}\""))
    })?;
    let done = tasks.complete_task(&best.id).await.map_err(service_error)?;
    Ok(ToolSuccess::new(
        format!("I've marked \"{}\" as done.", done.title),
        to_data(&done),
    ))
}

/// Picks the pending task whose title best matches `query`.
pub fn best_task_match<'a>(tasks: &'a [Task], query: &str) -> Option<&'a Task> {
    let matcher = SkimMatcherV2::default().ignore_case();
    tasks
        .iter()
        .filter(|t| !t.completed)
        .filter_map(|t| matcher.fuzzy_match(&t.title, query).map(|score| (score, t)))
        .max_by_key(|(score, _)| *score)
        .map(|(_, t)| t)
}

// --- Music ---

async fn play_music(services: &ToolServices, args: PlayMusicArgs) -> ToolOutcome {
    let query = require_text("play_music", "query", &args.query)?;
    let music = services.music().await?;
    let track = music.play(&query).await.map_err(service_error)?;
    Ok(ToolSuccess::new(
        format!("Now playing \"{}\" by {}.", track.title, track.artist),
        to_data(&track),
    ))
}

async fn pause_music(services: &ToolServices) -> ToolOutcome {
    let music = services.music().await?;
    music.pause().await.map_err(service_error)?;
    Ok(ToolSuccess::new("I've paused the music.", Value::Null))
}

async fn skip_track(services: &ToolServices) -> ToolOutcome {
    let music = services.music().await?;
    let next = music.skip().await.map_err(service_error)?;
    let detail = match &next {
        Some(track) => format!("Skipped. Up next is \"{}\" by {}.", track.title, track.artist),
        None => "Skipped. That was the last track in the queue.".to_string(),
    };
    Ok(ToolSuccess::new(detail, to_data(&next)))
}

async fn now_playing(services: &ToolServices) -> ToolOutcome {
    let music = services.music().await?;
    let state = music.now_playing().await.map_err(service_error)?;
    let detail = match (&state.track, state.is_playing) {
        (Some(track), true) => format!("\"{}\" by {} is playing.", track.title, track.artist),
        (Some(track), false) => format!("\"{}\" by {} is paused.", track.title, track.artist),
        (None, _) => "Nothing is playing right now.".to_string(),
    };
    Ok(ToolSuccess::new(detail, to_data(&state)))
}

// --- Email ---

async fn list_unread_emails(services: &ToolServices, args: ListEmailsArgs) -> ToolOutcome {
    let limit = args.limit.unwrap_or(5).clamp(1, 20);
    let email = services.email().await?;
    let messages = email.list_unread(limit).await.map_err(service_error)?;
    let detail = if messages.is_empty() {
        "You have no unread email.".to_string()
    } else {
        let listed: Vec<String> = messages
            .iter()
            .take(3)
            .map(|m| format!("\"{}\" from {}", m.subject, m.from))
            .collect();
        format!("You have {} unread email(s), including {}.", messages.len(), listed.join(", "))
    };
    Ok(ToolSuccess::new(detail, to_data(&messages)))
}

async fn send_email(services: &ToolServices, args: SendEmailArgs) -> ToolOutcome {
    const NAME: &str = "send_email";
    let to = require_text(NAME, "to", &args.to)?;
    if !to.contains('@') {
        return Err(invalid(NAME, format!("'{to}' is not an email address")));
    }
    let subject = require_text(NAME, "subject", &args.subject)?;
    let email = services.email().await?;
    email
        .send(OutgoingEmail {
            to: to.clone(),
            subject: subject.clone(),
            body: args.body,
        })
        .await
        .map_err(service_error)?;
    Ok(ToolSuccess::new(
        format!("I've sent \"{subject}\" to {to}."),
        json!({ "to": to, "subject": subject }),
    ))
}

// --- Productivity ---

async fn productivity_summary(services: &ToolServices, args: ProductivitySummaryArgs) -> ToolOutcome {
    let range = match args.range.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("today") => ReportRange::Today,
        Some("week") => ReportRange::Week,
        Some(other) => {
            return Err(invalid(
                "get_productivity_summary",
                format!("range must be 'today' or 'week', not '{other}'"),
            ));
        }
    };
    let productivity = services.productivity().await?;
    let summary = productivity.summary(range).await.map_err(service_error)?;
    let period = match range {
        ReportRange::Today => "today",
        ReportRange::Week => "this week",
    };
    let mut detail = format!(
        "You've focused for {} minutes {period}, with {} minutes of distractions.",
        summary.focused_minutes, summary.distracted_minutes
    );
    if let Some(top) = &summary.top_activity {
        detail.push_str(&format!(" Most of your time went to {top}."));
    }
    Ok(ToolSuccess::new(detail, to_data(&summary)))
}

async fn start_focus_session(services: &ToolServices, args: StartFocusArgs) -> ToolOutcome {
    let minutes = args.minutes.unwrap_or(25);
    if !(5..=180).contains(&minutes) {
        return Err(invalid(
            "start_focus_session",
            "a focus session must last between 5 and 180 minutes",
        ));
    }
    let productivity = services.productivity().await?;
    let session = productivity.start_focus(minutes).await.map_err(service_error)?;
    Ok(ToolSuccess::new(
        format!(
            "Focus mode is on for {} minutes, until {}.",
            session.minutes,
            session.ends_at.format("%-I:%M %p")
        ),
        to_data(&session),
    ))
}

// --- Web search ---

async fn web_search(services: &ToolServices, args: WebSearchArgs) -> ToolOutcome {
    let query = require_text("web_search", "query", &args.query)?;
    let limit = args.limit.unwrap_or(5).clamp(1, 10);
    let search = services.web_search().await?;
    let results = search.search(&query, limit).await.map_err(service_error)?;
    let detail = match results.first() {
        Some(top) => format!("I found {} result(s); the top one is \"{}\".", results.len(), top.title),
        None => format!("I couldn't find anything for \"{query}\"."),
    };
    Ok(ToolSuccess::new(detail, to_data(&results)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::handles::testing::StaticFactory;
    use crate::tools::services::{
        CalendarEvent, MockCalendarService, MockMusicService, MockTaskService, Track,
    };
    use crate::tools::{Integration, ToolHandle};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn now() -> DateTime<FixedOffset> {
        Utc.with_ymd_and_hms(2025, 3, 13, 9, 0, 0).unwrap().fixed_offset()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn services_with(handle: ToolHandle) -> ToolServices {
        ToolServices::new("user-1", Arc::new(StaticFactory::default().with(handle)))
    }

    #[tokio::test]
    async fn unknown_function_is_a_typed_error() {
        let services = ToolServices::new("user-1", Arc::new(StaticFactory::default()));
        let outcome = dispatch(&services, "launch_rocket", "{}", now()).await;
        assert_eq!(outcome, Err(ToolError::UnrecognizedFunction("launch_rocket".into())));
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let services = ToolServices::new("user-1", Arc::new(StaticFactory::default()));
        let outcome = dispatch(&services, "create_task", "{not json", now()).await;
        assert!(matches!(outcome, Err(ToolError::InvalidArguments { .. })));
        let outcome = dispatch(&services, "create_task", r#"{"due": "soon"}"#, now()).await;
        assert!(matches!(outcome, Err(ToolError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn missing_integration_reports_not_connected() {
        let services = ToolServices::new("user-1", Arc::new(StaticFactory::default()));
        let outcome = dispatch(&services, "play_music", r#"{"query":"jazz"}"#, now()).await;
        assert_eq!(outcome, Err(ToolError::NotConnected(Integration::Music)));
    }

    #[tokio::test]
    async fn creating_an_event_reports_detail_and_effect() {
        let mut calendar = MockCalendarService::new();
        calendar
            .expect_create_event()
            .withf(|e| e.title == "Sync" && e.end - e.start == Duration::hours(1))
            .times(1)
            .returning(|e| {
                Ok(CalendarEvent {
                    id: "evt-1".into(),
                    title: e.title,
                    start: e.start,
                    end: Some(e.end),
                    location: None,
                })
            });
        let services = services_with(ToolHandle::Calendar(Arc::new(calendar)));

        let success = dispatch(
            &services,
            "create_calendar_event",
            r#"{"title":"Sync","start":"2025-03-14T15:00:00Z"}"#,
            now(),
        )
        .await
        .unwrap();

        assert_eq!(
            success.detail,
            "I've added \"Sync\" to your calendar for Fri, Mar 14 at 3:00 PM."
        );
        assert_eq!(
            success.effect,
            Some(ToolEffect::EventCreated {
                id: "evt-1".into(),
                title: "Sync".into(),
                start: Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap(),
            })
        );
    }

    #[tokio::test]
    async fn event_times_follow_the_user_offset() {
        let mut calendar = MockCalendarService::new();
        calendar
            .expect_create_event()
            .withf(|e| e.start == Utc.with_ymd_and_hms(2025, 3, 14, 20, 0, 0).unwrap())
            .times(2)
            .returning(|e| {
                Ok(CalendarEvent {
                    id: "evt-2".into(),
                    title: e.title,
                    start: e.start,
                    end: Some(e.end),
                    location: None,
                })
            });
        let services = services_with(ToolHandle::Calendar(Arc::new(calendar)));
        let eastern = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = now().with_timezone(&eastern);

        for start in ["2025-03-14T15:00:00-05:00", "2025-03-14T15:00"] {
            let arguments = json!({ "title": "Sync", "start": start }).to_string();
            let success = dispatch(&services, "create_calendar_event", &arguments, now)
                .await
                .unwrap();
            assert_eq!(
                success.detail,
                "I've added \"Sync\" to your calendar for Fri, Mar 14 at 3:00 PM."
            );
        }
    }

    #[tokio::test]
    async fn events_in_the_past_are_rejected_before_calling_the_service() {
        let mut calendar = MockCalendarService::new();
        calendar.expect_create_event().never();
        let services = services_with(ToolHandle::Calendar(Arc::new(calendar)));
        let outcome = dispatch(
            &services,
            "create_calendar_event",
            r#"{"title":"Sync","start":"2025-03-01T15:00:00Z"}"#,
            now(),
        )
        .await;
        assert!(matches!(outcome, Err(ToolError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn service_errors_become_user_safe_messages() {
        let mut music = MockMusicService::new();
        music
            .expect_play()
            .returning(|_| Err(ServiceError::Unauthorized("music".into())));
        let services = services_with(ToolHandle::Music(Arc::new(music)));
        let outcome = dispatch(&services, "play_music", r#"{"query":"jazz"}"#, now()).await;
        assert_eq!(
            outcome,
            Err(ToolError::Service(
                "your music connection has expired, please reconnect it".into()
            ))
        );
    }

    #[tokio::test]
    async fn complete_task_uses_fuzzy_title_match() {
        let mut tasks = MockTaskService::new();
        tasks.expect_list_tasks().returning(|_| {
            Ok(vec![
                Task { id: "1".into(), title: "Buy groceries".into(), due: None, completed: false },
                Task { id: "2".into(), title: "Call the dentist".into(), due: None, completed: false },
            ])
        });
        tasks
            .expect_complete_task()
            .withf(|id| id.to_string() == "2")
            .returning(|_| {
                Ok(Task { id: "2".into(), title: "Call the dentist".into(), due: None, completed: true })
            });
        let services = services_with(ToolHandle::Tasks(Arc::new(tasks)));

        let success = dispatch(&services, "complete_task", r#"{"title":"dentist"}"#, now())
            .await
            .unwrap();
        assert_eq!(success.detail, "I've marked \"Call the dentist\" as done.");
    }

    #[tokio::test]
    async fn skip_track_without_arguments() {
        let mut music = MockMusicService::new();
        music.expect_skip().returning(|| {
            Ok(Some(Track { title: "So What".into(), artist: "Miles Davis".into() }))
        });
        let services = services_with(ToolHandle::Music(Arc::new(music)));
        let success = dispatch(&services, "skip_track", "", now()).await.unwrap();
        assert_eq!(success.detail, "Skipped. Up next is \"So What\" by Miles Davis.");
    }

    #[test]
    fn timestamps_accept_rfc3339_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap();
        assert_eq!(parse_timestamp("f", "start", "2025-03-14T15:00:00Z", &utc()).unwrap(), expected);
        assert_eq!(
            parse_timestamp("f", "start", "2025-03-14T16:00:00+01:00", &utc()).unwrap(),
            expected
        );
        assert_eq!(parse_timestamp("f", "start", "2025-03-14T15:00", &utc()).unwrap(), expected);
        assert!(parse_timestamp("f", "start", "tomorrow at 3", &utc()).is_err());

        let berlin = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(parse_timestamp("f", "start", "2025-03-14T16:00", &berlin).unwrap(), expected);
    }

    #[test]
    fn best_match_ignores_completed_tasks() {
        let tasks = vec![
            Task { id: "1".into(), title: "Write report".into(), due: None, completed: true },
            Task { id: "2".into(), title: "Review report draft".into(), due: None, completed: false },
        ];
        assert_eq!(best_task_match(&tasks, "report").map(|t| t.id.as_str()), Some("2"));
        assert!(best_task_match(&tasks, "zzz").is_none());
    }
}
