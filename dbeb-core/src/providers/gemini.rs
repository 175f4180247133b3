//! Google Gemini API provider implementation.
//!
//! Key differences from OpenAI-style chat APIs:
//! - Auth via `?key=API_KEY` query parameter
//! - System instruction is a top-level `system_instruction` field
//! - Roles are `"user"` / `"model"`
//! - Tool calls use `functionCall` / `functionResponse` content parts
//! - Streaming uses `:streamGenerateContent?alt=sse`

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Metadata key under which raw `functionCall` parts are kept on assistant messages.
const RAW_PARTS_KEY: &str = "gemini_raw_parts";

/// Metadata key naming the tool a result message answers.
pub const TOOL_NAME_KEY: &str = "tool_name";

/// Google Gemini API provider.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    max_tokens: usize,
}

impl GeminiProvider {
    /// Create a provider, taking the key from `config.api_key` or the
    /// environment variable named by `config.api_key_env`.
    ///
    /// A missing key is only a warning here; every model call then fails
    /// with [`LlmError::AuthFailed`].
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&config.api_key_env).ok())
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(
                env = %config.api_key_env,
                "Gemini API key not set; model calls will fail until it is provided"
            );
        }
        Self::build(config, api_key)
    }

    /// Create a provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        Self::build(config, Some(api_key))
    }

    fn build(config: &LlmConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_key_env: config.api_key_env.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.api_key.as_deref().ok_or_else(|| LlmError::AuthFailed {
            provider: format!("Gemini (env var '{}' not set)", self.api_key_env),
        })
    }

    /// Build the JSON request body for the Gemini API.
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let max_tokens = request.max_tokens.unwrap_or(self.max_tokens);
        let (system_text, non_system_messages) =
            Self::extract_system_instruction(&request.messages);

        let raw_contents: Vec<Value> = non_system_messages
            .iter()
            .map(|msg| Self::message_to_gemini_json(msg))
            .collect();
        let contents = Self::fix_gemini_turns(raw_contents);

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": max_tokens,
                "temperature": request.temperature,
            },
        });

        if let Some(system) = &system_text {
            body["system_instruction"] = json!({ "parts": [{"text": system}] });
        }

        if !request.stop_sequences.is_empty() {
            body["generationConfig"]["stopSequences"] = json!(request.stop_sequences);
        }

        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            let function_declarations: Vec<Value> =
                tools.iter().map(Self::tool_definition_to_json).collect();
            body["tools"] = json!([{ "functionDeclarations": function_declarations }]);
        }

        body
    }

    /// Split system messages out of the conversation.
    fn extract_system_instruction(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system_parts: Vec<String> = system.iter().map(|m| m.content.joined_text()).collect();
        let system_text = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system_text, rest)
    }

    /// Convert a single `Message` to Gemini JSON format.
    ///
    /// Assistant messages that carried function calls are replayed from their
    /// stored raw parts so provider-specific fields survive the round trip.
    fn message_to_gemini_json(msg: &Message) -> Value {
        let role = match msg.role {
            Role::Assistant => "model",
            Role::User | Role::Tool | Role::System => "user",
        };

        if msg.role == Role::Assistant
            && let Some(raw_parts) = msg.metadata.get(RAW_PARTS_KEY)
        {
            return json!({ "role": role, "parts": raw_parts });
        }

        let tool_name = msg
            .metadata
            .get(TOOL_NAME_KEY)
            .and_then(Value::as_str)
            .unwrap_or("tool");

        json!({
            "role": role,
            "parts": Self::content_to_gemini_parts(&msg.content, tool_name),
        })
    }

    fn content_to_gemini_parts(content: &Content, tool_name: &str) -> Value {
        match content {
            Content::Text { text } => json!([{ "text": text }]),
            Content::ToolCall {
                name, arguments, ..
            } => json!([{ "functionCall": { "name": name, "args": arguments } }]),
            Content::ToolResult { output, .. } => {
                // Gemini requires the response to be an object.
                let response_value = match serde_json::from_str::<Value>(output) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    Ok(other) => json!({ "result": other }),
                    Err(_) => json!({ "result": output }),
                };
                json!([{
                    "functionResponse": { "name": tool_name, "response": response_value }
                }])
            }
            Content::MultiPart { parts } => Value::Array(
                parts
                    .iter()
                    .flat_map(|part| match Self::content_to_gemini_parts(part, tool_name) {
                        Value::Array(arr) => arr,
                        other => vec![other],
                    })
                    .collect(),
            ),
        }
    }

    /// Post-process contents to satisfy Gemini's turn rules:
    /// consecutive same-role turns are merged, `functionResponse` names are
    /// aligned with the preceding `functionCall`s, empty turns are dropped
    /// and the first turn is a user turn.
    fn fix_gemini_turns(contents: Vec<Value>) -> Vec<Value> {
        let mut merged: Vec<Value> = Vec::with_capacity(contents.len());
        for entry in contents {
            let same_role = merged
                .last()
                .is_some_and(|last| last["role"] == entry["role"]);
            if same_role {
                if let (Some(last), Some(new_parts)) = (merged.last_mut(), entry["parts"].as_array())
                    && let Some(existing) = last["parts"].as_array_mut()
                {
                    existing.extend(new_parts.iter().cloned());
                }
            } else {
                merged.push(entry);
            }
        }

        for i in 1..merged.len() {
            let call_names: Vec<String> = merged[i - 1]["parts"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p["functionCall"]["name"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            if call_names.is_empty() {
                continue;
            }
            if let Some(parts) = merged[i]["parts"].as_array_mut() {
                let responses = parts.iter_mut().filter(|p| p.get("functionResponse").is_some());
                for (part, name) in responses.zip(&call_names) {
                    part["functionResponse"]["name"] = Value::String(name.clone());
                }
            }
        }

        merged.retain(|entry| entry["parts"].as_array().is_none_or(|p| !p.is_empty()));

        if merged
            .first()
            .is_some_and(|m| m["role"].as_str() != Some("user"))
        {
            merged.insert(0, json!({ "role": "user", "parts": [{ "text": "Hello" }] }));
        }
        merged
    }

    fn tool_definition_to_json(tool: &ToolDefinition) -> Value {
        json!({
            "name": tool.name,
            "description": tool.description,
            "parameters": Self::sanitize_schema(&tool.parameters),
        })
    }

    /// Recursively keep only the JSON Schema keys Gemini accepts.
    fn sanitize_schema(schema: &Value) -> Value {
        const ALLOWED_KEYS: &[&str] = &[
            "type",
            "description",
            "properties",
            "required",
            "enum",
            "items",
            "format",
            "nullable",
        ];

        match schema {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(key, _)| ALLOWED_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| {
                        let cleaned = match (key.as_str(), value) {
                            ("properties", Value::Object(props)) => Value::Object(
                                props
                                    .iter()
                                    .map(|(k, v)| (k.clone(), Self::sanitize_schema(v)))
                                    .collect(),
                            ),
                            ("items", v) => Self::sanitize_schema(v),
                            _ => value.clone(),
                        };
                        (key.clone(), cleaned)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn parse_usage(metadata: &Value) -> TokenUsage {
        TokenUsage {
            input_tokens: metadata["promptTokenCount"].as_u64().unwrap_or(0) as usize,
            output_tokens: metadata["candidatesTokenCount"].as_u64().unwrap_or(0) as usize,
        }
    }

    /// Parse a Gemini API response JSON into a `CompletionResponse`.
    fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
        let candidate = body["candidates"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing or empty 'candidates' array in response".to_string(),
            })?;

        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'parts' array in candidate content".to_string(),
            })?;

        let mut message = Message::new(Role::Assistant, Self::parse_parts(parts));
        if parts.iter().any(|p| p.get("functionCall").is_some()) {
            message = message.with_metadata(RAW_PARTS_KEY, Value::Array(parts.to_vec()));
        }

        Ok(CompletionResponse {
            message,
            usage: Self::parse_usage(&body["usageMetadata"]),
            model: body["modelVersion"].as_str().unwrap_or("gemini").to_string(),
            finish_reason: candidate["finishReason"].as_str().map(String::from),
        })
    }

    /// Parse Gemini parts into a `Content` value.
    fn parse_parts(parts: &[Value]) -> Content {
        let mut content_parts: Vec<Content> = Vec::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                content_parts.push(Content::text(text));
            } else if let Some(fc) = part.get("functionCall") {
                // Gemini does not assign call ids.
                let id = format!("gemini_call_{}", uuid::Uuid::new_v4());
                content_parts.push(Content::tool_call(
                    id,
                    fc["name"].as_str().unwrap_or_default(),
                    fc["args"].clone(),
                ));
            } else {
                debug!(?part, "Ignoring unknown Gemini part type");
            }
        }

        if content_parts.len() == 1 {
            content_parts.remove(0)
        } else if content_parts.is_empty() {
            Content::text("")
        } else {
            Content::MultiPart {
                parts: content_parts,
            }
        }
    }

    /// Map an HTTP status code to the appropriate `LlmError`.
    fn map_http_error(status: reqwest::StatusCode, body_text: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: 30,
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
        }
    }

    fn endpoint_url(&self, model: &str, method: &str) -> Result<String, LlmError> {
        Ok(format!(
            "{}/models/{}:{}?key={}",
            self.base_url,
            model,
            method,
            self.api_key()?
        ))
    }

    fn stream_url(&self, model: &str) -> Result<String, LlmError> {
        Ok(format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url,
            model,
            self.api_key()?
        ))
    }

    /// Remove and decode the next complete line from `buffer`.
    ///
    /// Bytes after the last newline stay buffered, so a code point split
    /// across network chunks is decoded only once it is whole.
    fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
        let newline_pos = buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Forward one SSE payload. Returns `Err(())` once the receiver is gone.
    async fn process_stream_chunk(
        data: &Value,
        tx: &mpsc::Sender<StreamEvent>,
        usage: &mut TokenUsage,
    ) -> Result<(), ()> {
        if data["usageMetadata"].is_object() {
            *usage = Self::parse_usage(&data["usageMetadata"]);
        }

        let Some(parts) = data["candidates"][0]["content"]["parts"].as_array() else {
            return Ok(());
        };

        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    tx.send(StreamEvent::Token(text.to_string()))
                        .await
                        .map_err(|_| ())?;
                }
            } else if let Some(fc) = part.get("functionCall") {
                let id = format!("gemini_call_{}", uuid::Uuid::new_v4());
                let events = [
                    StreamEvent::ToolCallStart {
                        id: id.clone(),
                        name: fc["name"].as_str().unwrap_or_default().to_string(),
                        raw_function_call: Some(part.clone()),
                    },
                    StreamEvent::ToolCallDelta {
                        id: id.clone(),
                        arguments_delta: fc["args"].to_string(),
                    },
                    StreamEvent::ToolCallEnd { id },
                ];
                for event in events {
                    tx.send(event).await.map_err(|_| ())?;
                }
            }
        }
        Ok(())
    }

    fn parse_sse_line(line: &str) -> Option<Value> {
        let data_str = line.trim().strip_prefix("data:")?.trim();
        match serde_json::from_str::<Value>(data_str) {
            Ok(value) => Some(value),
            Err(e) => {
                let preview: String = data_str.chars().take(200).collect();
                warn!(error = %e, data_preview = %preview, "Failed to parse Gemini SSE JSON chunk");
                None
            }
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = self.build_request_body(&request);
        let url = self.endpoint_url(model, "generateContent")?;

        debug!(model, "Sending Gemini completion request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Request to Gemini API failed: {}", e),
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = self.build_request_body(&request);
        let url = self.stream_url(model)?;

        debug!(model, "Sending Gemini streaming request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Streaming request to Gemini API failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body_text));
        }

        let mut byte_stream = response.bytes_stream();
        let mut usage = TokenUsage::default();
        let mut line_buffer: Vec<u8> = Vec::new();

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read streaming chunk: {}", e),
            })?;
            line_buffer.extend_from_slice(&chunk);

            while let Some(line) = Self::take_line(&mut line_buffer) {
                if let Some(data) = Self::parse_sse_line(&line)
                    && Self::process_stream_chunk(&data, &tx, &mut usage).await.is_err()
                {
                    debug!("Stream receiver dropped, abandoning Gemini stream");
                    return Ok(());
                }
            }
        }

        let rest = String::from_utf8_lossy(&line_buffer);
        if let Some(data) = Self::parse_sse_line(&rest)
            && Self::process_stream_chunk(&data, &tx, &mut usage).await.is_err()
        {
            return Ok(());
        }

        let _ = tx.send(StreamEvent::Done { usage }).await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
