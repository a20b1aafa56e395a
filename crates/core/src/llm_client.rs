use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionTool, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Represents a tool call requested by the LLM.
pub type ToolCall = async_openai::types::ChatCompletionMessageToolCall;

/// Represents the events that can be yielded from a streaming text response.
#[derive(Debug, Clone)]
pub enum LLMStreamEvent {
    TextChunk(String),
}

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent, OpenAIError>> + Send>>;

/// The outcome of the model's first pass over a turn.
#[derive(Debug, Clone)]
pub enum LLMAction {
    /// The LLM decided to respond directly with text.
    TextResponse(String),
    /// The LLM asked for one or more tools, optionally alongside some text.
    ToolCalls {
        calls: Vec<ToolCall>,
        text: Option<String>,
    },
}

/// A generic client for interacting with an LLM.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a single, non-streaming call to the LLM to decide on the next action.
    ///
    /// `tools` may be empty, in which case no tool catalog is attached.
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction>;

    /// Makes a streaming call to the LLM after tools have been executed.
    async fn stream_after_tools(
        &self,
        history_with_tool_results: Vec<ChatCompletionRequestMessage>,
    ) -> Result<LLMStream>;
}

/// Drains a narration stream into a single string, stopping at the first error.
pub async fn collect_stream(mut stream: LLMStream) -> Result<String> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        let LLMStreamEvent::TextChunk(chunk) = event.context("Narration stream failed")?;
        text.push_str(&chunk);
    }
    Ok(text)
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn decide_action(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMAction> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if !tools.is_empty() {
            builder.tools(tools).tool_choice("auto");
        }
        let request = builder.build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .context("LLM response contained no choices")?;

        let text = choice.message.content.filter(|c| !c.trim().is_empty());
        match choice.message.tool_calls {
            Some(calls) if !calls.is_empty() => Ok(LLMAction::ToolCalls { calls, text }),
            _ => text
                .map(LLMAction::TextResponse)
                .context("LLM response had neither text content nor tool calls."),
        }
    }

    async fn stream_after_tools(
        &self,
        history_with_tool_results: Vec<ChatCompletionRequestMessage>,
    ) -> Result<LLMStream> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(history_with_tool_results)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let content = response.choices.into_iter().next()?.delta.content?;
                    if content.is_empty() {
                        None
                    } else {
                        Some(Ok(LLMStreamEvent::TextChunk(content)))
                    }
                }
                Err(e) => Some(Err(e)),
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn collect_stream_concatenates_chunks() {
        let chunks: LLMStream = Box::pin(stream::iter(vec![
            Ok(LLMStreamEvent::TextChunk("You have ".into())),
            Ok(LLMStreamEvent::TextChunk("two meetings.".into())),
        ]));
        assert_eq!(collect_stream(chunks).await.unwrap(), "You have two meetings.");
    }

    #[tokio::test]
    async fn collect_stream_surfaces_errors() {
        let chunks: LLMStream = Box::pin(stream::iter(vec![
            Ok(LLMStreamEvent::TextChunk("partial".into())),
            Err(OpenAIError::InvalidArgument("boom".into())),
        ]));
        assert!(collect_stream(chunks).await.is_err());
    }
}
