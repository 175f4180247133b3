//! Agent graph: the tool-calling loop behind every chat turn.
//!
//! A turn moves through `Start -> Agent -> (Tools -> Agent)* -> End`. Each
//! entry into `Agent` is one streamed model invocation and counts as a hop;
//! `Tools` runs every requested call in order and appends the results. The
//! turn's messages reach the session store only once the graph hits `End`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::config::AgentConfig;
use crate::dispatch::{ToolContext, ToolDispatcher};
use crate::error::{AgentError, LlmError};
use crate::providers::gemini::TOOL_NAME_KEY;
use crate::session::SessionStore;
use crate::types::{
    CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage, ToolOutput,
};

/// Nodes of the agent graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphState {
    Start,
    Agent,
    Tools,
    End,
}

/// Progress emitted while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A text delta from the model.
    Token(String),
    ToolStarted { name: String },
    ToolFinished { name: String, is_error: bool },
}

/// A finished turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The final assistant message.
    pub reply: Message,
    /// States visited, in order.
    pub path: Vec<GraphState>,
    pub hops: usize,
    pub usage: TokenUsage,
}

impl TurnOutcome {
    pub fn reply_text(&self) -> String {
        self.reply.content.joined_text()
    }
}

/// The agent graph, shared across requests.
pub struct AgentGraph {
    brain: Brain,
    tools: Arc<dyn ToolDispatcher>,
    sessions: Arc<SessionStore>,
    config: AgentConfig,
}

impl AgentGraph {
    pub fn new(
        brain: Brain,
        tools: Arc<dyn ToolDispatcher>,
        sessions: Arc<SessionStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            brain,
            tools,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one user turn on `thread_id`.
    ///
    /// Tokens are forwarded on `events` as they stream. If the receiving end
    /// goes away the turn stops at the next hop boundary, or before the
    /// commit, with [`AgentError::Disconnected`]; nothing is committed.
    pub async fn run_turn(
        &self,
        ctx: &ToolContext,
        thread_id: &str,
        user_text: &str,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnOutcome, AgentError> {
        if user_text.trim().is_empty() {
            return Err(AgentError::EmptyInput);
        }

        let history = self.sessions.history(thread_id).await;
        let mut turn: Vec<Message> = vec![Message::user(user_text)];
        let mut path = vec![GraphState::Start];
        let mut state = GraphState::Agent;
        let mut hops = 0;
        let mut usage = TokenUsage::default();

        debug!(
            thread_id,
            request_id = %ctx.request_id,
            history = history.len(),
            "Starting agent turn"
        );

        loop {
            path.push(state);
            state = match state {
                GraphState::Start => GraphState::Agent,
                GraphState::Agent => {
                    hops += 1;
                    if hops > self.config.max_hops {
                        warn!(thread_id, max = self.config.max_hops, "Agent hop limit exceeded");
                        return Err(AgentError::MaxHopsExceeded {
                            max: self.config.max_hops,
                        });
                    }
                    if events.is_closed() {
                        return Err(AgentError::Disconnected);
                    }

                    let mut conversation = history.clone();
                    conversation.extend(turn.iter().cloned());
                    let response = self.stream_completion(&conversation, events).await?;
                    usage.accumulate(&response.usage);

                    let wants_tools = response.message.has_tool_calls();
                    turn.push(response.message);
                    if wants_tools {
                        GraphState::Tools
                    } else {
                        GraphState::End
                    }
                }
                GraphState::Tools => {
                    let calls: Vec<(String, String, Value)> = turn
                        .last()
                        .map(|m| {
                            m.content
                                .tool_calls()
                                .into_iter()
                                .map(|c| (c.id.to_string(), c.name.to_string(), c.arguments.clone()))
                                .collect()
                        })
                        .unwrap_or_default();

                    for (call_id, name, args) in calls {
                        turn.push(self.run_tool(ctx, &call_id, &name, args, events).await);
                    }
                    GraphState::Agent
                }
                GraphState::End => break,
            };
        }

        if events.is_closed() {
            debug!(thread_id, "Client left before commit; discarding turn");
            return Err(AgentError::Disconnected);
        }

        let reply = turn
            .last()
            .cloned()
            .unwrap_or_else(|| Message::assistant(""));
        self.sessions.commit(thread_id, turn).await;
        info!(thread_id, hops, tokens = usage.total(), "Agent turn complete");

        Ok(TurnOutcome {
            reply,
            path,
            hops,
            usage,
        })
    }

    /// Execute one tool call. Failures become error results for the model.
    async fn run_tool(
        &self,
        ctx: &ToolContext,
        call_id: &str,
        name: &str,
        args: Value,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Message {
        let _ = events
            .send(AgentEvent::ToolStarted {
                name: name.to_string(),
            })
            .await;

        let output = match self.tools.dispatch(ctx, name, args).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool call failed");
                ToolOutput::error(e.to_string())
            }
        };
        let is_error = output.is_error();
        debug!(tool = name, is_error, chars = output.content.len(), "Tool call finished");

        let _ = events
            .send(AgentEvent::ToolFinished {
                name: name.to_string(),
                is_error,
            })
            .await;

        Message::tool_result(call_id, output.content, is_error)
            .with_metadata(TOOL_NAME_KEY, Value::String(name.to_string()))
    }

    /// Stream one model invocation, forwarding text deltas and assembling
    /// tool-call deltas into the final message.
    async fn stream_completion(
        &self,
        conversation: &[Message],
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<CompletionResponse, LlmError> {
        let (tx, mut rx) = mpsc::channel(64);
        let request = self
            .brain
            .request(conversation, Some(self.tools.definitions()));
        let provider = self.brain.provider().clone();
        let producer = tokio::spawn(async move { provider.complete_streaming(request, tx).await });

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        // id -> (name, accumulated arguments), in arrival order.
        let mut call_order: Vec<String> = Vec::new();
        let mut calls: HashMap<String, (String, String)> = HashMap::new();
        let mut raw_calls: HashMap<String, Value> = HashMap::new();
        let mut stream_error = None;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(token) => {
                    if !token.is_empty() {
                        text.push_str(&token);
                        let _ = events.send(AgentEvent::Token(token)).await;
                    }
                }
                StreamEvent::ToolCallStart {
                    id,
                    name,
                    raw_function_call,
                } => {
                    call_order.push(id.clone());
                    calls.insert(id.clone(), (name, String::new()));
                    if let Some(raw) = raw_function_call {
                        raw_calls.insert(id, raw);
                    }
                }
                StreamEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    if let Some((_, args)) = calls.get_mut(&id) {
                        args.push_str(&arguments_delta);
                    }
                }
                StreamEvent::ToolCallEnd { .. } => {}
                StreamEvent::Done { usage: u } => {
                    usage = u;
                    break;
                }
                StreamEvent::Error(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }
        drop(rx);

        producer.await.map_err(|e| LlmError::Streaming {
            message: format!("Streaming task failed: {e}"),
        })??;
        if let Some(message) = stream_error {
            return Err(LlmError::Streaming { message });
        }

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(Content::text(&text));
        }
        for id in &call_order {
            if let Some((name, args)) = calls.get(id) {
                let arguments = serde_json::from_str(args).unwrap_or_else(|_| serde_json::json!({}));
                parts.push(Content::tool_call(id, name, arguments));
            }
        }
        let content = match parts.len() {
            0 => Content::text(""),
            1 => parts.remove(0),
            _ => Content::MultiPart { parts },
        };

        let mut message = Message::new(Role::Assistant, content);
        if !raw_calls.is_empty() {
            let mut raw_parts = Vec::new();
            if !text.is_empty() {
                raw_parts.push(serde_json::json!({ "text": text }));
            }
            raw_parts.extend(call_order.iter().filter_map(|id| raw_calls.get(id).cloned()));
            message = message.with_metadata("gemini_raw_parts", Value::Array(raw_parts));
        }

        let finish_reason = if call_order.is_empty() { "stop" } else { "tool_calls" };
        Ok(CompletionResponse {
            message,
            usage,
            model: self.brain.model_name().to_string(),
            finish_reason: Some(finish_reason.to_string()),
        })
    }
}
