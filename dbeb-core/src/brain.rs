//! Brain module: LLM provider abstraction and interaction.
//!
//! Defines the `LlmProvider` trait for model-agnostic completions, the
//! `Brain` wrapper that prepends the system prompt, and a scriptable mock
//! provider used by tests and offline runs.

use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Trait for LLM providers, supporting both full and streaming completions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Perform a streaming completion, sending events to the channel.
    ///
    /// Implementations stop quietly when the receiver is dropped.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// The system prompt used for chat turns unless configured otherwise.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the DBEB knowledge assistant. \
Answer questions using the knowledge base and the documents the user has uploaded.

Tools:
- search_global_knowledge: the shared knowledge base. Use it for general questions about the core dataset.
- search_session_knowledge: documents uploaded in this conversation. Use it when the user refers to a file they provided.

If a tool returns an error or nothing relevant, answer from the conversation and any context included in the user's message. \
Say so plainly when the information is not available. Keep answers concise and cite the document when it helps.";

/// Wraps a provider with a fixed system prompt and sampling settings.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    system_prompt: String,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, system_prompt: impl Into<String>) -> Self {
        Self {
            provider,
            system_prompt: system_prompt.into(),
            temperature: 0.5,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Construct messages for the LLM with the system prompt prepended.
    pub fn build_messages(&self, conversation: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(Message::system(&self.system_prompt));
        }
        messages.extend_from_slice(conversation);
        messages
    }

    /// Assemble a request for `conversation` with this brain's settings.
    pub fn request(&self, conversation: &[Message], tools: Option<Vec<ToolDefinition>>) -> CompletionRequest {
        CompletionRequest {
            messages: self.build_messages(conversation),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
}

/// A queued mock reply: either a response or a failure.
enum MockReply {
    Response(CompletionResponse),
    Failure(LlmError),
}

/// A mock LLM provider for testing and development.
///
/// Replies are served from a FIFO queue; every request is recorded so tests
/// can inspect exactly what the model was sent.
pub struct MockLlmProvider {
    model: String,
    replies: Mutex<Vec<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            replies: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response to be returned by the next call.
    pub fn queue_response(&self, response: CompletionResponse) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(MockReply::Response(response));
        }
    }

    /// Queue a failure to be returned by the next call.
    pub fn queue_error(&self, error: LlmError) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(MockReply::Failure(error));
        }
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Create a tool call response for testing.
    pub fn tool_call_response(tool_name: &str, arguments: serde_json::Value) -> CompletionResponse {
        let call_id = format!("call_{}", uuid::Uuid::new_v4());
        CompletionResponse {
            message: Message::new(
                Role::Assistant,
                Content::tool_call(&call_id, tool_name, arguments),
            ),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    fn next_reply(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let reply = self.replies.lock().ok().and_then(|mut replies| {
            if replies.is_empty() {
                None
            } else {
                Some(replies.remove(0))
            }
        });
        match reply {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::Failure(error)) => Err(error),
            None => Ok(Self::text_response(
                "I'm a mock LLM. No queued responses available.",
            )),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.next_reply(request)
    }

    /// Text is streamed word by word; tool calls as start/delta/end triples.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let response = self.next_reply(request)?;
        let parts = match response.message.content {
            Content::MultiPart { parts } => parts,
            other => vec![other],
        };
        for part in parts {
            match part {
                Content::Text { text } => {
                    for word in text.split_inclusive(' ') {
                        if tx.send(StreamEvent::Token(word.to_string())).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Content::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    let events = [
                        StreamEvent::ToolCallStart {
                            id: id.clone(),
                            name,
                            raw_function_call: None,
                        },
                        StreamEvent::ToolCallDelta {
                            id: id.clone(),
                            arguments_delta: arguments.to_string(),
                        },
                        StreamEvent::ToolCallEnd { id },
                    ];
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
        }
        let _ = tx
            .send(StreamEvent::Done {
                usage: response.usage,
            })
            .await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
