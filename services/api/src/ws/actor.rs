//! The per-session actor.
//!
//! One task owns a `SessionActor` and is the only consumer of its mailbox.
//! Client frames, timer ticks and evictions all arrive as `SessionEvent`s and
//! are handled one at a time, so a turn never interleaves with another turn,
//! an audio commit, or a proactive message for the same session.

use super::audio::{AudioBuffer, CommitOutcome, CommitSettings, Fragment, commit_utterance};
use super::outbox::Outbox;
use super::proactive::{ProactiveEvent, ProactiveScheduler, Subject, minutes_until};
use super::protocol::{ClientMessage, ProactiveKind, RealtimeConfig, ServerMessage};
use super::turn::DIDNT_CATCH;
use crate::auth::AuthError;
use crate::error::{CloseReason, SessionError};
use crate::models::MessageRole;
use crate::registry::Liveness;
use crate::state::AppState;
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Timelike, Utc};
use companion_core::filters::{DedupWindow, ReplyGuard};
use companion_core::patterns::InteractionPatterns;
use companion_core::retry::RetryPolicy;
use companion_core::speech::parse_voice;
use companion_core::tools::{Integration, ToolHandle, ToolServices};
use companion_core::{BotState, StateMachine};
use rand::seq::IndexedRandom;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const IDLE_ANIMATIONS: &[&str] = &["stretch", "look_around", "blink", "hum"];

/// Everything that can wake a session up.
pub enum SessionEvent {
    Client(ClientMessage),
    /// A binary frame, treated as a raw audio fragment.
    BinaryAudio(Vec<u8>),
    /// A text frame that did not parse as a client message.
    Malformed(String),
    Proactive(ProactiveEvent),
    /// The speaking timer with this sequence number ran out.
    SpeechFinished(u64),
    Evict(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
}

enum Wake {
    Event(SessionEvent),
    Expired,
    Gone,
}

pub struct SessionActor {
    pub(super) id: Uuid,
    pub(super) user_id: String,
    pub(super) app: Arc<AppState>,
    pub(super) outbox: Outbox,
    pub(super) liveness: Arc<Liveness>,
    pub(super) mailbox: mpsc::Sender<SessionEvent>,
    pub(super) machine: StateMachine,
    pub(super) auth_expires_at: DateTime<Utc>,
    pub(super) audio: AudioBuffer,
    pub(super) dedup: DedupWindow,
    pub(super) history: VecDeque<HistoryEntry>,
    pub(super) tools: ToolServices,
    pub(super) guard: ReplyGuard,
    pub(super) patterns: InteractionPatterns,
    pub(super) context: Map<String, Value>,
    pub(super) realtime: Option<RealtimeConfig>,
    pub(super) speech_seq: u64,
    pub(super) scheduler: ProactiveScheduler,
    /// Events and tasks already announced, with the event start or task due time.
    reminded: HashMap<Subject, DateTime<Utc>>,
    greeted: bool,
}

impl SessionActor {
    pub fn new(
        id: Uuid,
        user_id: String,
        app: Arc<AppState>,
        outbox: Outbox,
        liveness: Arc<Liveness>,
        mailbox: mpsc::Sender<SessionEvent>,
        auth_expires_at: DateTime<Utc>,
    ) -> Self {
        let engine = app.engine.clone();
        let scheduler = ProactiveScheduler::new(
            outbox.child_token(),
            mailbox.clone(),
            engine.proactive.clone(),
        );
        Self {
            id,
            tools: ToolServices::new(user_id.clone(), app.tool_factory.clone()),
            user_id,
            outbox,
            liveness,
            mailbox,
            machine: StateMachine::new(engine.state_history_limit),
            auth_expires_at,
            audio: AudioBuffer::new(),
            dedup: DedupWindow::new(engine.dedup_capacity),
            history: VecDeque::with_capacity(engine.history_capacity),
            guard: ReplyGuard::new(engine.greeting_cooldown, engine.duplicate_window),
            patterns: InteractionPatterns::new(engine.proactive.suggestion_min_uses),
            context: Map::new(),
            realtime: None,
            speech_seq: 0,
            scheduler,
            reminded: HashMap::new(),
            greeted: false,
            app,
        }
    }

    pub fn observe_state(&self) -> watch::Receiver<BotState> {
        self.machine.observe()
    }

    /// Announces the session, hydrates history and arms the timers.
    pub async fn open(&mut self) {
        self.outbox.send(ServerMessage::Connected {
            session_id: self.id,
        });
        self.outbox
            .send(ServerMessage::state_change(self.machine.current()));

        let window = self.app.engine.context_window;
        match self.app.conversations.recent(&self.user_id, window).await {
            Ok(messages) => {
                debug!(count = messages.len(), "Hydrated conversation history");
                for message in messages {
                    self.push_history(message.role, message.content);
                }
            }
            Err(e) => warn!(error = ?e, "Failed to load previous conversation"),
        }

        let available = self.tools.warm_up().await;
        info!(?available, "Session opened");
        self.scheduler.start();
    }

    /// Drives the session until the connection goes away or is closed.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<SessionEvent>) {
        self.open().await;
        let outbox = self.outbox.clone();
        loop {
            let deadline = self.expiry_deadline();
            let wake = tokio::select! {
                biased;
                _ = outbox.closed() => Wake::Gone,
                event = mailbox.recv() => event.map_or(Wake::Gone, Wake::Event),
                _ = time::sleep_until(deadline) => Wake::Expired,
            };
            match wake {
                Wake::Event(event) => {
                    if self.handle(event).await == Flow::Close {
                        break;
                    }
                }
                Wake::Expired => {
                    info!("Session credential expired");
                    self.outbox.close(CloseReason::AuthenticationExpired);
                    break;
                }
                Wake::Gone => break,
            }
        }
        self.shutdown();
    }

    /// Cancels timers, drops tool handles and leaves the registry.
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        self.tools.release();
        self.audio.clear();
        self.outbox.close(CloseReason::Normal);
        self.app.registry.deregister(self.id);
        info!(diagnostics = ?self.machine.diagnostics(), "Session closed");
    }

    pub async fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Client(message) => self.route(message).await,
            SessionEvent::BinaryAudio(bytes) => {
                if self.credential_expired() {
                    return self.close_expired("binary_audio");
                }
                self.liveness.touch();
                if let Err(e) = self.on_audio(Fragment::Raw(bytes)) {
                    self.reject(e);
                }
                Flow::Continue
            }
            SessionEvent::Malformed(reason) => {
                if self.credential_expired() {
                    return self.close_expired("malformed");
                }
                self.reject(SessionError::validation(format!("Malformed message: {reason}")));
                Flow::Continue
            }
            SessionEvent::Proactive(event) => {
                if self.credential_expired() {
                    debug!(?event, "Credential expired, proactive tick dropped");
                    return Flow::Continue;
                }
                self.on_proactive(event).await;
                Flow::Continue
            }
            SessionEvent::SpeechFinished(seq) => {
                if seq == self.speech_seq && self.machine.current() == BotState::Speaking {
                    self.set_state(BotState::Idle, "speech finished");
                }
                Flow::Continue
            }
            SessionEvent::Evict(reason) => {
                info!(reason = reason.description(), "Evicting session");
                self.outbox.close(reason);
                Flow::Close
            }
        }
    }

    async fn route(&mut self, message: ClientMessage) -> Flow {
        let kind = message.kind();
        let is_refresh = matches!(message, ClientMessage::RefreshToken { .. });
        if !is_refresh && self.credential_expired() {
            return self.close_expired(kind);
        }
        self.liveness.touch();
        debug!(kind, state = %self.machine.current(), "Routing client message");

        let result = match message {
            ClientMessage::RefreshToken { token } => self.refresh(&token),
            ClientMessage::StartRealtime { config } => self.start_realtime(config),
            ClientMessage::AudioChunk { audio } => self.on_audio(Fragment::Base64(audio)),
            ClientMessage::CommitAudio => self.commit_audio().await,
            ClientMessage::TextMessage { text, id } => self.on_text(text, id).await,
            ClientMessage::StopRealtime => {
                self.stop_realtime();
                Ok(())
            }
            ClientMessage::UpdateContext { context } => self.update_context(context).await,
        };

        match result {
            Err(e) if e.is_fatal() && self.credential_expired() => {
                warn!(error = %e, "Refresh failed after the credential expired");
                self.outbox.close(CloseReason::AuthenticationExpired);
                Flow::Close
            }
            Err(e) => {
                self.reject(e);
                Flow::Continue
            }
            Ok(()) => Flow::Continue,
        }
    }

    fn credential_expired(&self) -> bool {
        Utc::now() >= self.auth_expires_at
    }

    fn close_expired(&self, kind: &str) -> Flow {
        warn!(kind, "Message received after the credential expired");
        self.outbox.close(CloseReason::AuthenticationExpired);
        Flow::Close
    }

    fn expiry_deadline(&self) -> Instant {
        let remaining = (self.auth_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Instant::now() + remaining
    }

    /// Answers a recoverable failure with an `error` envelope.
    pub(super) fn reject(&self, error: SessionError) {
        warn!(error = %error, "Rejected client input");
        self.outbox.send(ServerMessage::error(error.to_string()));
    }

    fn refresh(&mut self, token: &str) -> Result<(), SessionError> {
        let claims = self.app.verifier.verify(token)?;
        if claims.sub != self.user_id {
            return Err(AuthError::UserMismatch.into());
        }
        let expires_at = claims.expires_at()?;
        self.auth_expires_at = expires_at;
        info!(%expires_at, "Session credential refreshed");
        self.outbox.send(ServerMessage::TokenRefreshed { expires_at });
        Ok(())
    }

    fn start_realtime(&mut self, config: RealtimeConfig) -> Result<(), SessionError> {
        if let Some(voice) = config.voice.as_deref() {
            if parse_voice(voice).is_none() {
                return Err(SessionError::validation(format!("Unknown voice '{voice}'")));
            }
        }
        if let Some(format) = config.format.as_deref() {
            if format != "mp3" {
                return Err(SessionError::validation(format!(
                    "Unsupported audio format '{format}'"
                )));
            }
        }
        info!(voice = ?config.voice, input = ?config.input_format, "Realtime voice enabled");
        self.realtime = Some(config);
        Ok(())
    }

    fn stop_realtime(&mut self) {
        self.realtime = None;
        self.audio.clear();
        if self.machine.current() == BotState::Listening {
            self.set_state(BotState::Idle, "realtime stopped");
        }
        info!("Realtime voice disabled");
    }

    fn on_audio(&mut self, fragment: Fragment) -> Result<(), SessionError> {
        match self.machine.current() {
            BotState::Idle => {
                self.set_state(BotState::Listening, "audio received");
            }
            BotState::Speaking => {
                self.speech_seq += 1;
                self.set_state(BotState::Listening, "barge-in");
            }
            _ => {}
        }
        if let Err(rejected) = self.audio.push(fragment, self.app.engine.max_audio_bytes) {
            if self.machine.current() == BotState::Listening {
                self.set_state(BotState::Idle, "audio rejected");
            }
            return Err(rejected.into());
        }
        Ok(())
    }

    async fn commit_audio(&mut self) -> Result<(), SessionError> {
        let id = Uuid::new_v4().to_string();
        if self.machine.current() == BotState::Speaking {
            self.speech_seq += 1;
            self.set_state(BotState::Listening, "barge-in");
        }
        self.set_state(BotState::Thinking, "audio committed");

        let engine = &self.app.engine;
        let settings = CommitSettings {
            min_bytes: engine.min_audio_bytes,
            max_bytes: engine.max_audio_bytes,
            format: self
                .realtime
                .as_ref()
                .map(|r| r.input_format)
                .unwrap_or_default(),
            sample_rate: engine.input_sample_rate,
            silence_threshold: engine.silence_threshold,
        };
        let retry = self.retry_policy();
        let outcome = commit_utterance(
            &mut self.audio,
            settings,
            self.app.transcriber.as_ref(),
            &self.app.noise,
            &retry,
        )
        .await;

        match outcome {
            Ok(CommitOutcome::Accepted(text)) => {
                info!(chars = text.len(), "Utterance transcribed");
                self.run_turn(text, id).await;
                Ok(())
            }
            Ok(CommitOutcome::Rejected(rejected)) if rejected.is_validation_error() => {
                self.set_state(BotState::Idle, "audio rejected");
                Err(rejected.into())
            }
            Ok(CommitOutcome::Rejected(rejected)) => {
                debug!(reason = %rejected, "Asking the user to repeat");
                self.outbox.send(ServerMessage::Response {
                    text: DIDNT_CATCH.to_string(),
                    id,
                });
                self.set_state(BotState::Idle, "nothing to transcribe");
                Ok(())
            }
            Err(e) => {
                warn!(error = ?e, "Transcription failed");
                self.apologize(&id);
                Ok(())
            }
        }
    }

    async fn on_text(&mut self, text: String, id: Option<String>) -> Result<(), SessionError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::validation("Message text is empty"));
        }
        if !self.dedup.check_and_insert(&id) {
            return Err(SessionError::validation(format!(
                "Message {id} was already processed"
            )));
        }
        self.run_turn(text.to_string(), id).await;
        Ok(())
    }

    async fn update_context(&mut self, context: Value) -> Result<(), SessionError> {
        let Value::Object(update) = context else {
            return Err(SessionError::validation("Context must be a JSON object"));
        };
        for (key, value) in update {
            if value.is_null() {
                self.context.remove(&key);
            } else {
                self.context.insert(key, value);
            }
        }
        let available = self.tools.warm_up().await;
        debug!(keys = self.context.len(), ?available, "Client context updated");
        Ok(())
    }

    pub(super) fn push_history(&mut self, role: MessageRole, content: String) {
        if self.history.len() == self.app.engine.history_capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry { role, content });
    }

    pub(super) fn retry_policy(&self) -> RetryPolicy {
        let engine = &self.app.engine;
        RetryPolicy::new(
            engine.external_call_attempts,
            engine.external_call_timeout,
            Duration::from_millis(250),
        )
    }

    /// Moves along the adjacency table and tells the client.
    ///
    /// Returns false when the transition is illegal; the state is unchanged.
    pub(super) fn set_state(&mut self, to: BotState, reason: &str) -> bool {
        if self.machine.current() == to {
            return true;
        }
        match self.machine.transition(to, reason) {
            Ok(_) => {
                self.outbox.send(ServerMessage::state_change(to));
                true
            }
            Err(e) => {
                warn!(error = %e, %reason, "State change rejected");
                false
            }
        }
    }

    pub(super) fn force_state(&mut self, to: BotState, reason: &str) {
        if self.machine.current() == to {
            return;
        }
        self.machine.force(to, reason);
        self.outbox.send(ServerMessage::state_change(to));
    }

    /// Enters `thinking` from whatever the session is doing.
    pub(super) fn enter_thinking(&mut self) {
        match self.machine.current() {
            BotState::Thinking => {}
            BotState::Speaking => {
                self.speech_seq += 1;
                self.set_state(BotState::Idle, "interrupted by new input");
                self.set_state(BotState::Thinking, "new input");
            }
            _ => {
                self.set_state(BotState::Thinking, "new input");
            }
        }
    }

    /// The current instant at the user's UTC offset. The client context's
    /// `utcOffsetMinutes` wins over the server's own zone.
    pub(super) fn user_now(&self) -> DateTime<FixedOffset> {
        self.context
            .get("utcOffsetMinutes")
            .and_then(Value::as_i64)
            .and_then(|minutes| i32::try_from(minutes * 60).ok())
            .and_then(FixedOffset::east_opt)
            .map(|tz| Utc::now().with_timezone(&tz))
            .unwrap_or_else(|| Local::now().fixed_offset())
    }

    /// The user's wall-clock time.
    pub(super) fn local_now(&self) -> NaiveDateTime {
        self.user_now().naive_local()
    }

    fn send_proactive(&self, kind: ProactiveKind, text: Option<String>, animation: Option<&str>) {
        debug!(?kind, "Proactive message");
        self.outbox.send(ServerMessage::Proactive {
            kind,
            text,
            animation: animation.map(str::to_string),
        });
    }

    pub(super) async fn on_proactive(&mut self, event: ProactiveEvent) {
        if self.outbox.is_closed() {
            return;
        }
        let idle = self.machine.current() == BotState::Idle;
        let config = self.app.engine.proactive.clone();
        match event {
            ProactiveEvent::Greeting => {
                if self.greeted || !idle {
                    return;
                }
                self.greeted = true;
                let text = greeting_for(self.local_now().hour());
                self.send_proactive(ProactiveKind::Greeting, Some(text.to_string()), Some("wave"));
            }
            ProactiveEvent::TaskCheck if idle => self.check_tasks().await,
            ProactiveEvent::EventCheck => self.check_events(config.event_reminder_lead).await,
            ProactiveEvent::IdleAnimation if idle => {
                if self.liveness.idle_for() < config.idle_animation_after {
                    return;
                }
                let animation = IDLE_ANIMATIONS.choose(&mut rand::rng()).copied();
                self.send_proactive(ProactiveKind::IdleAnimation, None, animation);
            }
            ProactiveEvent::BreakReminder if idle => {
                let hour = self.local_now().hour();
                let (start, end) = config.work_hours;
                if hour >= start && hour < end {
                    self.send_proactive(
                        ProactiveKind::BreakReminder,
                        Some("You've been at it for a while. How about a short break?".to_string()),
                        Some("stretch"),
                    );
                }
            }
            ProactiveEvent::Suggestion if idle => {
                let now = self.local_now();
                if let Some(suggestion) = self.patterns.suggest(now) {
                    self.send_proactive(ProactiveKind::Suggestion, Some(suggestion.text), None);
                }
            }
            ProactiveEvent::Reminder {
                kind,
                text,
                subject,
                at,
            } => {
                if self.reminded.contains_key(&subject) {
                    debug!(?subject, "Already announced, reminder skipped");
                    return;
                }
                self.reminded.insert(subject, at);
                self.send_proactive(kind, Some(text), None);
            }
            ProactiveEvent::TaskCheck
            | ProactiveEvent::IdleAnimation
            | ProactiveEvent::BreakReminder
            | ProactiveEvent::Suggestion => {
                debug!("Session busy, proactive tick skipped");
            }
        }
    }

    async fn check_tasks(&mut self) {
        let Some(ToolHandle::Tasks(service)) = self.tools.get(Integration::Tasks) else {
            return;
        };
        let listed = time::timeout(self.app.engine.external_call_timeout, service.list_tasks(false)).await;
        let tasks = match listed {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                debug!(error = %e, "Task check failed");
                return;
            }
            Err(_) => {
                debug!("Task check timed out");
                return;
            }
        };
        let now = Utc::now();
        let pending: HashSet<&str> = tasks
            .iter()
            .filter(|t| !t.completed)
            .map(|t| t.id.as_str())
            .collect();
        // Completed or deleted tasks no longer need their entry.
        self.reminded.retain(|subject, _| match subject {
            Subject::Task(id) => pending.contains(id.as_str()),
            Subject::Event(_) => true,
        });
        let mut overdue = Vec::new();
        for task in &tasks {
            let Some(due) = task.due.filter(|due| !task.completed && *due <= now) else {
                continue;
            };
            let subject = Subject::Task(task.id.clone());
            if !self.reminded.contains_key(&subject) {
                self.reminded.insert(subject, due);
                overdue.push(task);
            }
        }
        let text = match overdue.as_slice() {
            [] => return,
            [task] => format!("\"{}\" is overdue. Want to tackle it now?", task.title),
            [first, rest @ ..] => format!(
                "You have {} overdue tasks, starting with \"{}\".",
                rest.len() + 1,
                first.title
            ),
        };
        self.send_proactive(ProactiveKind::TaskReminder, Some(text), None);
    }

    async fn check_events(&mut self, lead: Duration) {
        let Some(ToolHandle::Calendar(service)) = self.tools.get(Integration::Calendar) else {
            return;
        };
        let now = Utc::now();
        let horizon = now + chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::minutes(10));
        let listed = time::timeout(
            self.app.engine.external_call_timeout,
            service.list_events(now, horizon),
        )
        .await;
        let events = match listed {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                debug!(error = %e, "Event check failed");
                return;
            }
            Err(_) => {
                debug!("Event check timed out");
                return;
            }
        };
        self.reminded.retain(|subject, at| match subject {
            Subject::Event(_) => *at >= now,
            Subject::Task(_) => true,
        });
        for event in events {
            let subject = Subject::Event(event.id.clone());
            if event.start < now || self.reminded.contains_key(&subject) {
                continue;
            }
            self.reminded.insert(subject, event.start);
            let minutes = minutes_until((event.start - now).to_std().unwrap_or_default());
            self.send_proactive(
                ProactiveKind::EventReminder,
                Some(format!("Heads up, \"{}\" starts in {minutes} minutes.", event.title)),
                None,
            );
        }
    }
}

fn greeting_for(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Good morning! I'm here whenever you need me.",
        12..=17 => "Good afternoon! Let me know if I can help with anything.",
        _ => "Good evening! I'm around if you need anything.",
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{FakeCalendar, FakeTasks, Harness, expired_token, token_for};
    use super::*;
    use crate::audio_utils;
    use companion_core::llm_client::LLMAction;
    use companion_core::tools::services::{CalendarEvent, Task};

    #[tokio::test]
    async fn open_announces_and_hydrates() {
        let h = Harness::builder()
            .history(&["earlier question", "earlier answer"])
            .build()
            .await;
        assert_eq!(h.actor.history.len(), 2);
        assert_eq!(h.actor.history[0].role, MessageRole::User);
        assert_eq!(h.actor.history[1].role, MessageRole::Assistant);
        assert!(matches!(
            h.opening.as_slice(),
            [ServerMessage::Connected { .. }, ServerMessage::StateChange { state: BotState::Idle, .. }]
        ));
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_processed_once() {
        let mut h = Harness::builder().build().await;
        h.llm.push(LLMAction::TextResponse("Sure, noted.".into()));
        h.llm.push(LLMAction::TextResponse("Noted again.".into()));

        for _ in 0..2 {
            h.text("Remember that I like tea", Some("m1")).await;
        }

        let messages = h.drain();
        let replies = Harness::replies(&messages);
        assert_eq!(replies, vec!["Sure, noted.".to_string()]);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::Error { message } if message.contains("already processed")
        )));
        assert_eq!(h.llm.calls(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_a_validation_error() {
        let mut h = Harness::builder().build().await;
        h.text("   ", None).await;
        let messages = h.drain();
        assert_eq!(messages, vec![ServerMessage::error("Message text is empty")]);
        assert_eq!(h.actor.machine.current(), BotState::Idle);
    }

    #[tokio::test]
    async fn malformed_frames_keep_the_connection_open() {
        let mut h = Harness::builder().build().await;
        let flow = h.actor.handle(SessionEvent::Malformed("missing field `type`".into())).await;
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(h.drain().as_slice(), [ServerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn short_audio_is_never_transcribed() {
        let mut h = Harness::builder().build().await;
        for chunk in vec![1u8; 4096].chunks(1024) {
            let audio = audio_utils::encode_base64(chunk);
            h.client(ClientMessage::AudioChunk { audio }).await;
        }
        h.client(ClientMessage::CommitAudio).await;

        let messages = h.drain();
        assert_eq!(h.transcriber.calls(), 0);
        assert!(h.actor.audio.is_empty());
        assert_eq!(Harness::replies(&messages), vec![DIDNT_CATCH.to_string()]);
        assert_eq!(
            Harness::states(&messages),
            vec![BotState::Listening, BotState::Thinking, BotState::Idle]
        );
    }

    #[tokio::test]
    async fn accepted_audio_becomes_a_turn() {
        let mut h = Harness::builder().transcript("What's the weather like?").build().await;
        h.llm.push(LLMAction::TextResponse("Sunny all day.".into()));
        h.actor.handle(SessionEvent::BinaryAudio(super::super::testing::speech(16_384))).await;
        h.client(ClientMessage::CommitAudio).await;

        let messages = h.drain();
        assert_eq!(h.transcriber.calls(), 1);
        assert!(messages.contains(&ServerMessage::Processing {
            text: "What's the weather like?".into()
        }));
        assert_eq!(Harness::replies(&messages), vec!["Sunny all day.".to_string()]);
        assert!(h.actor.audio.is_empty());
    }

    #[tokio::test]
    async fn oversized_audio_is_rejected_and_cleared() {
        let mut h = Harness::builder().engine(|e| e.max_audio_bytes = 1024).build().await;
        h.actor.handle(SessionEvent::BinaryAudio(vec![0; 2048])).await;
        let messages = h.drain();
        assert!(matches!(messages.last(), Some(ServerMessage::Error { .. })));
        assert!(h.actor.audio.is_empty());
        assert_eq!(h.actor.machine.current(), BotState::Idle);
    }

    #[tokio::test]
    async fn audio_while_speaking_barges_in() {
        let mut h = Harness::builder()
            .engine(|e| {
                e.speaking_min = Duration::from_secs(30);
                e.speaking_max = Duration::from_secs(30);
            })
            .build()
            .await;
        h.llm.push(LLMAction::TextResponse("A long story begins.".into()));
        h.text("Tell me a story", None).await;
        assert_eq!(h.actor.machine.current(), BotState::Speaking);
        let seq = h.actor.speech_seq;

        h.actor.handle(SessionEvent::BinaryAudio(vec![0; 64])).await;
        assert_eq!(h.actor.machine.current(), BotState::Listening);

        h.actor.handle(SessionEvent::SpeechFinished(seq)).await;
        assert_eq!(h.actor.machine.current(), BotState::Listening);
    }

    #[tokio::test]
    async fn stop_realtime_drops_partial_audio() {
        let mut h = Harness::builder().build().await;
        h.client(ClientMessage::StartRealtime {
            config: RealtimeConfig::default(),
        })
        .await;
        h.actor.handle(SessionEvent::BinaryAudio(vec![0; 64])).await;
        h.client(ClientMessage::StopRealtime).await;
        assert!(h.actor.realtime.is_none());
        assert!(h.actor.audio.is_empty());
        assert_eq!(h.actor.machine.current(), BotState::Idle);
    }

    #[tokio::test]
    async fn unknown_voices_are_rejected() {
        let mut h = Harness::builder().build().await;
        h.client(ClientMessage::StartRealtime {
            config: RealtimeConfig {
                voice: Some("robot".into()),
                ..Default::default()
            },
        })
        .await;
        assert!(h.actor.realtime.is_none());
        assert!(matches!(h.drain().as_slice(), [ServerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn refresh_extends_expiry_for_the_same_user() {
        let mut h = Harness::builder().build().await;
        let before = h.actor.auth_expires_at;
        let token = token_for("user-1", chrono::Duration::hours(2));
        h.client(ClientMessage::RefreshToken { token }).await;

        assert!(h.actor.auth_expires_at > before);
        assert!(matches!(h.drain().as_slice(), [ServerMessage::TokenRefreshed { .. }]));
    }

    #[tokio::test]
    async fn refresh_for_another_user_is_rejected() {
        let mut h = Harness::builder().build().await;
        let before = h.actor.auth_expires_at;
        let token = token_for("someone-else", chrono::Duration::hours(2));
        let flow = h.client(ClientMessage::RefreshToken { token }).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.actor.auth_expires_at, before);
        assert!(matches!(h.drain().as_slice(), [ServerMessage::Error { .. }]));
        assert!(!h.actor.outbox.is_closed());
    }

    #[tokio::test]
    async fn messages_after_expiry_close_the_connection() {
        let mut h = Harness::builder().build().await;
        h.actor.auth_expires_at = Utc::now() - chrono::Duration::seconds(1);

        let flow = h.text("hello?", None).await;
        assert_eq!(flow, Flow::Close);
        assert!(h.actor.outbox.is_closed());
        assert_eq!(h.close_reason(), Some(CloseReason::AuthenticationExpired));
        assert_eq!(h.llm.calls(), 0);
    }

    #[tokio::test]
    async fn refresh_after_expiry_is_still_accepted() {
        let mut h = Harness::builder().build().await;
        h.actor.auth_expires_at = Utc::now() - chrono::Duration::seconds(1);
        let token = token_for("user-1", chrono::Duration::hours(1));
        assert_eq!(h.client(ClientMessage::RefreshToken { token }).await, Flow::Continue);
        assert!(!h.actor.credential_expired());

        let mut h = Harness::builder().build().await;
        h.actor.auth_expires_at = Utc::now() - chrono::Duration::seconds(1);
        let flow = h.client(ClientMessage::RefreshToken { token: expired_token("user-1") }).await;
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn context_updates_merge_objects_only() {
        let mut h = Harness::builder().build().await;
        h.client(ClientMessage::UpdateContext {
            context: serde_json::json!({ "timezone": "Europe/Paris", "page": "home" }),
        })
        .await;
        h.client(ClientMessage::UpdateContext {
            context: serde_json::json!({ "page": null }),
        })
        .await;
        assert_eq!(h.actor.context.get("timezone"), Some(&Value::from("Europe/Paris")));
        assert!(!h.actor.context.contains_key("page"));
        assert!(h.drain().is_empty());

        h.client(ClientMessage::UpdateContext {
            context: Value::from("nope"),
        })
        .await;
        assert!(matches!(h.drain().as_slice(), [ServerMessage::Error { .. }]));
    }

    #[tokio::test]
    async fn eviction_closes_with_its_reason() {
        let mut h = Harness::builder().build().await;
        let flow = h.actor.handle(SessionEvent::Evict(CloseReason::IdleTimeout)).await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(h.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn greeting_fires_once_and_only_when_idle() {
        let mut h = Harness::builder().build().await;
        h.actor.on_proactive(ProactiveEvent::Greeting).await;
        h.actor.on_proactive(ProactiveEvent::Greeting).await;
        let messages = h.drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            ServerMessage::Proactive { kind: ProactiveKind::Greeting, .. }
        ));
        assert!(h.actor.guard.last_greeting().is_none());
    }

    #[tokio::test]
    async fn periodic_ticks_are_skipped_while_busy() {
        let mut h = Harness::builder()
            .engine(|e| e.proactive.idle_animation_after = Duration::ZERO)
            .build()
            .await;
        h.actor.set_state(BotState::Thinking, "test");
        h.drain();
        h.actor.on_proactive(ProactiveEvent::IdleAnimation).await;
        assert!(h.drain().is_empty());

        h.actor.set_state(BotState::Idle, "test");
        h.drain();
        h.actor.on_proactive(ProactiveEvent::IdleAnimation).await;
        assert!(matches!(
            h.drain().as_slice(),
            [ServerMessage::Proactive { kind: ProactiveKind::IdleAnimation, animation: Some(_), .. }]
        ));
    }

    #[tokio::test]
    async fn closing_silences_proactive_messages() {
        let mut h = Harness::builder().build().await;
        h.actor.handle(SessionEvent::Evict(CloseReason::Normal)).await;
        h.actor.shutdown();
        assert!(h.actor.scheduler.is_cancelled());
        h.actor
            .on_proactive(ProactiveEvent::Reminder {
                kind: ProactiveKind::EventReminder,
                text: "Heads up".into(),
                subject: Subject::Event("evt_1".into()),
                at: Utc::now(),
            })
            .await;
        h.actor.on_proactive(ProactiveEvent::Greeting).await;
        assert!(h.drain().is_empty());
        assert!(h.actor.tools.initialized().is_empty());
    }

    fn design_review(starts_in: chrono::Duration) -> CalendarEvent {
        CalendarEvent {
            id: "evt_9".into(),
            title: "Design review".into(),
            start: Utc::now() + starts_in,
            end: None,
            location: None,
        }
    }

    fn event_reminder(event: &CalendarEvent) -> ProactiveEvent {
        ProactiveEvent::Reminder {
            kind: ProactiveKind::EventReminder,
            text: format!("Heads up, \"{}\" starts in 5 minutes.", event.title),
            subject: Subject::Event(event.id.clone()),
            at: event.start,
        }
    }

    fn overdue_task(id: &str, title: &str) -> Task {
        Task {
            id: id.into(),
            title: title.into(),
            due: Some(Utc::now() - chrono::Duration::hours(1)),
            completed: false,
        }
    }

    #[tokio::test]
    async fn upcoming_events_are_announced_once() {
        let calendar = FakeCalendar::default().with_upcoming(design_review(chrono::Duration::minutes(6)));
        let mut h = Harness::builder().calendar(calendar).build().await;
        h.actor.on_proactive(ProactiveEvent::EventCheck).await;
        h.actor.on_proactive(ProactiveEvent::EventCheck).await;

        let messages = h.drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            ServerMessage::Proactive { kind: ProactiveKind::EventReminder, text: Some(text), .. }
                if text.contains("Design review") && text.contains("in 6 minutes")
        ));
    }

    #[tokio::test]
    async fn created_event_reminder_and_calendar_check_announce_once() {
        let event = design_review(chrono::Duration::minutes(5));
        let calendar = FakeCalendar::default().with_upcoming(event.clone());
        let mut h = Harness::builder().calendar(calendar).build().await;
        h.actor.on_proactive(event_reminder(&event)).await;
        h.actor.on_proactive(ProactiveEvent::EventCheck).await;
        assert_eq!(h.drain().len(), 1);

        let calendar = FakeCalendar::default().with_upcoming(event.clone());
        let mut h = Harness::builder().calendar(calendar).build().await;
        h.actor.on_proactive(ProactiveEvent::EventCheck).await;
        h.actor.on_proactive(event_reminder(&event)).await;
        assert_eq!(h.drain().len(), 1);
    }

    #[tokio::test]
    async fn started_events_are_forgotten() {
        let mut h = Harness::builder().calendar(FakeCalendar::default()).build().await;
        let started = Subject::Event("evt_old".into());
        h.actor.reminded.insert(started.clone(), Utc::now() - chrono::Duration::minutes(1));
        h.actor.on_proactive(ProactiveEvent::EventCheck).await;
        assert!(!h.actor.reminded.contains_key(&started));
    }

    #[tokio::test]
    async fn overdue_tasks_are_announced_once_and_forgotten_when_done() {
        let tasks = FakeTasks::default().with_task(overdue_task("task_1", "File expenses"));
        let mut h = Harness::builder().tasks(tasks.clone()).build().await;
        h.actor.on_proactive(ProactiveEvent::TaskCheck).await;
        h.actor.on_proactive(ProactiveEvent::TaskCheck).await;

        let messages = h.drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            ServerMessage::Proactive { kind: ProactiveKind::TaskReminder, text: Some(text), .. }
                if text.contains("File expenses")
        ));

        tasks.complete("task_1");
        h.actor.on_proactive(ProactiveEvent::TaskCheck).await;
        assert!(h.actor.reminded.is_empty());
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn proactive_ticks_are_dropped_once_the_credential_expires() {
        let mut h = Harness::builder().build().await;
        h.actor.auth_expires_at = Utc::now() - chrono::Duration::seconds(1);
        let flow = h.actor.handle(SessionEvent::Proactive(ProactiveEvent::Greeting)).await;
        assert_eq!(flow, Flow::Continue);
        assert!(h.drain().is_empty());
        assert!(!h.actor.greeted);
        assert!(!h.actor.outbox.is_closed());
    }

    #[tokio::test]
    async fn user_time_follows_the_context_offset() {
        let mut h = Harness::builder().build().await;
        h.client(ClientMessage::UpdateContext {
            context: serde_json::json!({ "utcOffsetMinutes": -300 }),
        })
        .await;
        let now = h.actor.user_now();
        assert_eq!(now.offset().local_minus_utc(), -5 * 3600);
        let drift = (now.with_timezone(&Utc) - Utc::now()).num_seconds().abs();
        assert!(drift < 5);
    }

    #[test]
    fn greetings_follow_the_clock() {
        assert!(greeting_for(8).starts_with("Good morning"));
        assert!(greeting_for(13).starts_with("Good afternoon"));
        assert!(greeting_for(23).starts_with("Good evening"));
    }
}
