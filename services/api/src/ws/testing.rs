//! Fakes and a harness for driving a `SessionActor` without a socket.

use super::actor::{Flow, SessionActor, SessionEvent};
use super::outbox::{Outbound, Outbox};
use super::protocol::{ClientMessage, ServerMessage};
use crate::auth::{Claims, JwtVerifier, issue_token};
use crate::config::EngineConfig;
use crate::db::{ConversationStore, MemoryStore};
use crate::error::CloseReason;
use crate::models::MessageRole;
use crate::registry::{ConnectionRegistry, Liveness};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestMessage, ChatCompletionTool,
    ChatCompletionToolType, FunctionCall,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use companion_core::BotState;
use companion_core::filters::NoiseFilter;
use companion_core::llm_client::{LLMAction, LLMClient, LLMStream, LLMStreamEvent, ToolCall};
use companion_core::speech::{SynthesizedAudio, Synthesizer, Transcriber};
use companion_core::tools::services::{
    CalendarEvent, CalendarService, NewCalendarEvent, NewTask, SearchResult, ServiceError, Task,
    TaskService, WebSearchService,
};
use companion_core::tools::{Integration, ToolHandle, ToolServiceFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

const SECRET: &[u8] = b"test-secret";
const USER: &str = "user-1";

pub fn token_for(user: &str, expires_in: Duration) -> String {
    let claims = Claims {
        sub: user.to_string(),
        exp: (Utc::now() + expires_in).timestamp(),
    };
    issue_token(SECRET, &claims).unwrap()
}

pub fn expired_token(user: &str) -> String {
    token_for(user, Duration::minutes(-5))
}

/// Loud PCM16 audio of `bytes` length.
pub fn speech(bytes: usize) -> Vec<u8> {
    (0..bytes / 2)
        .flat_map(|i| (if i % 2 == 0 { 6000i16 } else { -6000i16 }).to_le_bytes())
        .collect()
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ChatCompletionMessageToolCall {
        id: id.to_string(),
        r#type: ChatCompletionToolType::Function,
        function: FunctionCall {
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
    }
}

pub fn search_results() -> Vec<SearchResult> {
    vec![SearchResult {
        title: "Announcing Rust 1.85.0 and Rust 2024".into(),
        url: "https://blog.rust-lang.org/2025/02/20/Rust-1.85.0.html".into(),
        snippet: "The Rust 2024 edition is now stable.".into(),
    }]
}

/// Replays scripted decisions and narrations.
#[derive(Default)]
pub struct ScriptedLlm {
    actions: Mutex<VecDeque<Result<LLMAction, String>>>,
    narrations: Mutex<VecDeque<String>>,
    tool_counts: Mutex<Vec<usize>>,
}

impl ScriptedLlm {
    pub fn push(&self, action: LLMAction) {
        self.actions.lock().unwrap().push_back(Ok(action));
    }

    pub fn push_failure(&self, message: &str) {
        self.actions.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn push_narration(&self, text: &str) {
        self.narrations.lock().unwrap().push_back(text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.tool_counts.lock().unwrap().len()
    }

    /// Number of tools attached to each completion request.
    pub fn tool_counts(&self) -> Vec<usize> {
        self.tool_counts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMClient for ScriptedLlm {
    async fn decide_action(
        &self,
        _messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction> {
        self.tool_counts.lock().unwrap().push(tools.len());
        match self.actions.lock().unwrap().pop_front() {
            Some(Ok(action)) => Ok(action),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(LLMAction::TextResponse("Okay.".into())),
        }
    }

    async fn stream_after_tools(
        &self,
        _history_with_tool_results: Vec<ChatCompletionRequestMessage>,
    ) -> Result<LLMStream> {
        let text = self
            .narrations
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no narration scripted"))?;
        let events = vec![Ok(LLMStreamEvent::TextChunk(text))];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

pub struct CountingTranscriber {
    reply: String,
    calls: AtomicUsize,
}

impl CountingTranscriber {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for CountingTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _filename: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

#[derive(Default)]
pub struct RecordingSynthesizer {
    voices: Mutex<Vec<Option<String>>>,
}

impl RecordingSynthesizer {
    pub fn voices(&self) -> Vec<Option<String>> {
        self.voices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(&self, _text: &str, voice: Option<&str>) -> Result<SynthesizedAudio> {
        self.voices.lock().unwrap().push(voice.map(str::to_string));
        Ok(SynthesizedAudio {
            bytes: vec![0xff, 0xfb, 0x90],
            format: "mp3".into(),
        })
    }
}

#[derive(Clone, Default)]
pub struct FakeCalendar {
    created: Arc<Mutex<Vec<NewCalendarEvent>>>,
    upcoming: Arc<Mutex<Vec<CalendarEvent>>>,
}

impl FakeCalendar {
    pub fn created(&self) -> Vec<NewCalendarEvent> {
        self.created.lock().unwrap().clone()
    }

    pub fn with_upcoming(self, event: CalendarEvent) -> Self {
        self.upcoming.lock().unwrap().push(event);
        self
    }
}

#[async_trait]
impl CalendarService for FakeCalendar {
    async fn create_event(&self, event: NewCalendarEvent) -> Result<CalendarEvent, ServiceError> {
        let mut created = self.created.lock().unwrap();
        created.push(event.clone());
        Ok(CalendarEvent {
            id: format!("evt_{}", created.len()),
            title: event.title,
            start: event.start,
            end: Some(event.end),
            location: None,
        })
    }

    async fn list_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, ServiceError> {
        Ok(self
            .upcoming
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.start >= from && e.start <= to)
            .cloned()
            .collect())
    }
}

/// A task list the test can edit between checks.
#[derive(Clone, Default)]
pub struct FakeTasks {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl FakeTasks {
    pub fn with_task(self, task: Task) -> Self {
        self.tasks.lock().unwrap().push(task);
        self
    }

    pub fn complete(&self, id: &str) {
        for task in self.tasks.lock().unwrap().iter_mut().filter(|t| t.id == id) {
            task.completed = true;
        }
    }
}

#[async_trait]
impl TaskService for FakeTasks {
    async fn create_task(&self, task: NewTask) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock().unwrap();
        let created = Task {
            id: format!("task_{}", tasks.len() + 1),
            title: task.title,
            due: task.due,
            completed: false,
        };
        tasks.push(created.clone());
        Ok(created)
    }

    async fn list_tasks(&self, include_completed: bool) -> Result<Vec<Task>, ServiceError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| include_completed || !t.completed)
            .cloned()
            .collect())
    }

    async fn complete_task(&self, id: &str) -> Result<Task, ServiceError> {
        self.complete(id);
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("No task with id {id}")))
    }
}

struct FakeSearch(Vec<SearchResult>);

#[async_trait]
impl WebSearchService for FakeSearch {
    async fn search(&self, _query: &str, limit: u32) -> Result<Vec<SearchResult>, ServiceError> {
        Ok(self.0.iter().take(limit as usize).cloned().collect())
    }
}

/// Hands out whatever handles the test connected.
#[derive(Default)]
pub struct FakeFactory {
    handles: HashMap<Integration, ToolHandle>,
}

#[async_trait]
impl ToolServiceFactory for FakeFactory {
    async fn connect(
        &self,
        _user_id: &str,
        integration: Integration,
    ) -> Result<Option<ToolHandle>, ServiceError> {
        Ok(self.handles.get(&integration).cloned())
    }
}

pub struct HarnessBuilder {
    engine: EngineConfig,
    history: Vec<String>,
    transcript: String,
    factory: FakeFactory,
}

impl HarnessBuilder {
    pub fn engine(mut self, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        tweak(&mut self.engine);
        self
    }

    /// Previous conversation, alternating user and assistant turns.
    pub fn history(mut self, messages: &[&str]) -> Self {
        self.history = messages.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn transcript(mut self, text: &str) -> Self {
        self.transcript = text.to_string();
        self
    }

    pub fn calendar(mut self, calendar: FakeCalendar) -> Self {
        self.factory
            .handles
            .insert(Integration::Calendar, ToolHandle::Calendar(Arc::new(calendar)));
        self
    }

    pub fn tasks(mut self, tasks: FakeTasks) -> Self {
        self.factory
            .handles
            .insert(Integration::Tasks, ToolHandle::Tasks(Arc::new(tasks)));
        self
    }

    pub fn web_search(mut self, results: Vec<SearchResult>) -> Self {
        self.factory
            .handles
            .insert(Integration::WebSearch, ToolHandle::WebSearch(Arc::new(FakeSearch(results))));
        self
    }

    pub async fn build(self) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for (i, content) in self.history.iter().enumerate() {
            let role = if i % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            store.append(USER, Uuid::nil(), role, content).await.unwrap();
        }

        let llm = Arc::new(ScriptedLlm::default());
        let transcriber = Arc::new(CountingTranscriber {
            reply: self.transcript,
            calls: AtomicUsize::new(0),
        });
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let mailbox_capacity = self.engine.mailbox_capacity;
        let app = Arc::new(AppState {
            engine: Arc::new(self.engine),
            llm_client: llm.clone(),
            transcriber: transcriber.clone(),
            synthesizer: synthesizer.clone(),
            conversations: store.clone(),
            tool_factory: Arc::new(self.factory),
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            noise: Arc::new(NoiseFilter::with_defaults()),
            system_prompt: Arc::new("You are a helpful desk companion.".to_string()),
            registry: Arc::new(ConnectionRegistry::new()),
        });

        let (outbox, outbound) = Outbox::new();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(mailbox_capacity);
        let mut actor = SessionActor::new(
            Uuid::new_v4(),
            USER.to_string(),
            app,
            outbox,
            Arc::new(Liveness::new()),
            mailbox_tx,
            Utc::now() + Duration::hours(1),
        );
        actor.open().await;

        let mut harness = Harness {
            actor,
            outbound,
            _mailbox: mailbox_rx,
            llm,
            transcriber,
            synthesizer,
            store,
            opening: Vec::new(),
        };
        harness.opening = harness.drain();
        harness
    }
}

pub struct Harness {
    pub actor: SessionActor,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    _mailbox: mpsc::Receiver<SessionEvent>,
    pub llm: Arc<ScriptedLlm>,
    pub transcriber: Arc<CountingTranscriber>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub store: Arc<MemoryStore>,
    /// Messages sent while the session opened.
    pub opening: Vec<ServerMessage>,
}

impl Harness {
    /// Speaking ends immediately so turns settle back to `idle` inline.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            engine: EngineConfig {
                speaking_min: std::time::Duration::ZERO,
                speaking_max: std::time::Duration::ZERO,
                ..EngineConfig::default()
            },
            history: Vec::new(),
            transcript: String::new(),
            factory: FakeFactory::default(),
        }
    }

    pub async fn client(&mut self, message: ClientMessage) -> Flow {
        self.actor.handle(SessionEvent::Client(message)).await
    }

    pub async fn text(&mut self, text: &str, id: Option<&str>) -> Flow {
        self.client(ClientMessage::TextMessage {
            text: text.to_string(),
            id: id.map(str::to_string),
        })
        .await
    }

    /// Every queued envelope, skipping pings and close frames.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Message(message) = outbound {
                messages.push(message);
            }
        }
        messages
    }

    pub fn close_reason(&mut self) -> Option<CloseReason> {
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Close(reason) = outbound {
                return Some(reason);
            }
        }
        None
    }

    pub fn states(messages: &[ServerMessage]) -> Vec<BotState> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::StateChange { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn replies(messages: &[ServerMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Response { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}
