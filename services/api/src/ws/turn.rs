//! Conversation Turn Orchestrator
//!
//! A turn runs inline on the session actor: context assembly, the model's first
//! pass, sequential tool execution, an optional narration pass, duplicate
//! screening and delivery. Any failure along the way ends in a fixed apology
//! and a return to `idle`.

use super::actor::{SessionActor, SessionEvent};
use super::protocol::{RealtimeConfig, ServerMessage};
use crate::audio_utils;
use crate::error::SessionError;
use crate::models::MessageRole;
use anyhow::Result;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestToolMessageArgs,
    ChatCompletionRequestUserMessageArgs,
};
use chrono::Utc;
use companion_core::filters::is_greeting;
use companion_core::llm_client::{LLMAction, ToolCall, collect_stream};
use companion_core::tools::{
    ToolError, ToolKind, ToolOutcome, ToolResult, catalog, dispatch, summarize_results,
};
use companion_core::BotState;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

pub(super) const APOLOGY: &str = "I'm sorry, I ran into a problem. Could you try that again?";
pub(super) const DIDNT_CATCH: &str = "Sorry, I didn't catch that. Could you say it again?";

impl SessionActor {
    /// Processes one accepted utterance, typed or transcribed.
    #[instrument(name = "turn", skip(self, text), fields(turn_id = %id))]
    pub(super) async fn run_turn(&mut self, text: String, id: String) {
        self.outbox.send(ServerMessage::Processing { text: text.clone() });
        self.enter_thinking();
        if let Err(e) = self.orchestrate(&text, &id).await {
            error!(error = %e, "Turn failed");
            self.apologize(&id);
        }
    }

    /// The fixed reply for a failed turn. Always leaves the session idle.
    pub(super) fn apologize(&mut self, id: &str) {
        self.outbox.send(ServerMessage::Response {
            text: APOLOGY.to_string(),
            id: id.to_string(),
        });
        self.force_state(BotState::Idle, "turn failed");
    }

    async fn orchestrate(&mut self, text: &str, id: &str) -> Result<(), SessionError> {
        let greeting = is_greeting(text);
        if greeting && self.guard.should_suppress_greeting(Instant::now()) {
            info!("Greeting repeated inside the cooldown, not answering");
            self.set_state(BotState::Idle, "greeting suppressed");
            return Ok(());
        }

        self.remember(MessageRole::User, text).await;
        let messages = self.build_messages().map_err(SessionError::upstream)?;
        let available = self.tools.initialized();
        let tools = catalog::tools_for(&available).map_err(SessionError::upstream)?;
        debug!(messages = messages.len(), tools = tools.len(), "Requesting completion");

        let llm = self.app.llm_client.clone();
        let action = self
            .retry_policy()
            .run("completion", || llm.decide_action(messages.clone(), tools.clone()))
            .await
            .map_err(SessionError::upstream)?;

        let reply = match action {
            LLMAction::TextResponse(reply) => reply,
            LLMAction::ToolCalls { calls, text } => {
                self.set_state(BotState::Working, "tool calls requested");
                let results = self.execute_tools(&calls).await;
                self.compose_tool_reply(messages, calls, text, &results)
                    .await
                    .map_err(SessionError::upstream)?
            }
        };

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(SessionError::UpstreamModel("the model returned an empty reply".into()));
        }
        self.deliver(reply, id, greeting).await;
        Ok(())
    }

    fn build_messages(&self) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut prompt = self.app.system_prompt.to_string();
        prompt.push_str(&format!(
            "\n\n# Current Time\n\nUTC: {}\nUser's local time: {}",
            Utc::now().to_rfc3339(),
            self.local_now().format("%A, %B %-d %Y, %H:%M"),
        ));
        if !self.context.is_empty() {
            prompt.push_str(&format!(
                "\n\n# Client Context\n\n```json\n{}\n```",
                serde_json::to_string_pretty(&self.context)?
            ));
        }

        let mut messages: Vec<ChatCompletionRequestMessage> =
            vec![ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt)
                .build()?
                .into()];
        let skip = self
            .history
            .len()
            .saturating_sub(self.app.engine.context_window);
        for entry in self.history.iter().skip(skip) {
            match entry.role {
                MessageRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(entry.content.clone())
                        .build()?
                        .into(),
                ),
                MessageRole::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(entry.content.clone())
                        .build()?
                        .into(),
                ),
            }
        }
        Ok(messages)
    }

    /// Runs each call on its own failure boundary.
    async fn execute_tools(&mut self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let name = call.function.name.clone();
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(call.function.arguments.clone()));
            self.outbox.send(ServerMessage::FunctionCall {
                function: name.clone(),
                arguments,
            });

            let outcome = self.invoke(&name, &call.function.arguments).await;
            match &outcome {
                Ok(success) => {
                    info!(function = %name, "Tool call succeeded");
                    self.outbox.send(ServerMessage::FunctionResult {
                        function: name.clone(),
                        result: success.detail.clone(),
                    });
                    if let Some(effect) = &success.effect {
                        self.scheduler.notify(effect, Utc::now());
                    }
                    let at = self.local_now();
                    self.patterns.record(&name, at);
                }
                Err(e) => {
                    warn!(function = %name, error = %e, "Tool call failed");
                    self.outbox.send(ServerMessage::FunctionError {
                        function: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
            results.push(ToolResult {
                call_id: call.id.clone(),
                tool: name,
                outcome,
            });
        }
        results
    }

    async fn invoke(&self, name: &str, raw_arguments: &str) -> ToolOutcome {
        let call = dispatch(&self.tools, name, raw_arguments, self.user_now());
        match time::timeout(self.app.engine.external_call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(match catalog::lookup(name) {
                Some(spec) => ToolError::Timeout(spec.integration),
                None => ToolError::UnrecognizedFunction(name.to_string()),
            }),
        }
    }

    /// Direct model text wins; retrieval results are narrated; actions are summarized.
    async fn compose_tool_reply(
        &mut self,
        messages: Vec<ChatCompletionRequestMessage>,
        calls: Vec<ToolCall>,
        text: Option<String>,
        results: &[ToolResult],
    ) -> Result<String> {
        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
            return Ok(text);
        }
        let retrieved = results
            .iter()
            .any(|r| r.kind() == ToolKind::Retrieval && r.outcome.is_ok());
        if !retrieved {
            return Ok(summarize_results(results));
        }

        self.set_state(BotState::Thinking, "narrating tool results");
        let mut history = messages;
        history.push(
            ChatCompletionRequestAssistantMessageArgs::default()
                .tool_calls(calls)
                .build()?
                .into(),
        );
        for result in results {
            history.push(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(result.call_id.clone())
                    .content(result.to_model_content())
                    .build()?
                    .into(),
            );
        }

        let llm = self.app.llm_client.clone();
        let narration = self
            .retry_policy()
            .run("narration", || {
                let llm = llm.clone();
                let history = history.clone();
                async move { collect_stream(llm.stream_after_tools(history).await?).await }
            })
            .await;
        match narration {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => Ok(summarize_results(results)),
            Err(e) => {
                warn!(error = ?e, "Narration failed, falling back to the summary");
                Ok(summarize_results(results))
            }
        }
    }

    async fn deliver(&mut self, reply: &str, id: &str, answered_greeting: bool) {
        let now = Instant::now();
        if self.guard.is_duplicate_reply(reply, now) {
            info!("Reply repeats the previous one, not sending it");
            self.set_state(BotState::Idle, "duplicate reply");
            return;
        }
        if self.outbox.is_closed() {
            debug!("Connection closed during the turn, reply discarded");
            return;
        }

        self.remember(MessageRole::Assistant, reply).await;
        self.guard.record_reply(reply, answered_greeting, now);
        self.outbox.send(ServerMessage::Response {
            text: reply.to_string(),
            id: id.to_string(),
        });
        self.set_state(BotState::Speaking, "reply ready");

        if let Some(realtime) = self.realtime.clone() {
            self.speak(reply, &realtime).await;
        }
        self.schedule_speech_end(reply.chars().count());
    }

    async fn speak(&self, reply: &str, realtime: &RealtimeConfig) {
        let synthesizer = self.app.synthesizer.clone();
        let voice = realtime.voice.as_deref();
        match self
            .retry_policy()
            .run("synthesis", || synthesizer.synthesize(reply, voice))
            .await
        {
            Ok(audio) => {
                debug!(bytes = audio.bytes.len(), "Reply synthesized");
                self.outbox.send(ServerMessage::AudioResponse {
                    audio: audio_utils::encode_base64(&audio.bytes),
                    format: audio.format,
                });
            }
            Err(e) => warn!(error = ?e, "Speech synthesis failed, reply sent as text only"),
        }
    }

    /// Returns to `idle` once the reply has had time to play.
    fn schedule_speech_end(&mut self, chars: usize) {
        self.speech_seq += 1;
        let duration = self.app.engine.speaking_duration(chars);
        if duration.is_zero() {
            self.set_state(BotState::Idle, "speech finished");
            return;
        }
        let seq = self.speech_seq;
        let mailbox = self.mailbox.clone();
        let token = self.outbox.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep(duration) => {
                    let _ = mailbox.send(SessionEvent::SpeechFinished(seq)).await;
                }
            }
        });
    }

    /// Appends to the in-memory window and the conversation store.
    async fn remember(&mut self, role: MessageRole, content: &str) {
        self.push_history(role, content.to_string());
        let store = self.app.conversations.clone();
        let append = store.append(&self.user_id, self.id, role, content);
        match time::timeout(self.app.engine.external_call_timeout, append).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = ?e, %role, "Failed to persist message"),
            Err(_) => warn!(%role, "Persisting message timed out"),
        }
    }
}
