//! LLM provider contract and the two concrete vendor clients.
//!
//! Both vendors are reduced to the same normalized shape: text, tool calls
//! and token usage. Nothing vendor-specific leaks past this module.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::ai::types::{ChatRequest, ChatResponse, Content, MessageRole, ModelMessage, ToolCall};
use crate::task::TokenUsage;

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provider failures, classified for the retry layer.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Network(message) => crate::ai::retry::is_retryable_message(message),
            ProviderError::InvalidResponse(_) | ProviderError::Cancelled => false,
        }
    }
}

/// One LLM vendor. Implementations return the normalized response shape and
/// never panic on malformed payloads.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

fn classify_reqwest_error(err: reqwest::Error) -> ProviderError {
    if let Some(status) = err.status() {
        return ProviderError::Http {
            status: status.as_u16(),
            message: err.to_string(),
        };
    }
    ProviderError::Network(err.to_string())
}

async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ProviderError::Http { status, message }
}

// ── Anthropic ──────────────────────────────────────────────────────────

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(anthropic_message)
            .collect();

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system_prompt,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn parse_response(json: &Value) -> Result<ChatResponse, ProviderError> {
        let blocks = json
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::InvalidResponse("missing content array".to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                        text.push_str(chunk);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                    });
                }
                _ => {}
            }
        }

        let prompt_tokens = json
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = json
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(ChatResponse {
            text,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}

fn anthropic_message(message: &ModelMessage) -> Value {
    let role = match message.role {
        MessageRole::Assistant => "assistant",
        _ => "user",
    };
    let content: Vec<Value> = message
        .content
        .iter()
        .map(|block| match block {
            Content::Text { text } => json!({"type": "text", "text": text}),
            Content::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            Content::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": output,
                "is_error": is_error,
            }),
        })
        .collect();
    json!({"role": role, "content": content})
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_body(request);
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Self::parse_response(&json)
    }
}

// ── OpenAI ─────────────────────────────────────────────────────────────

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &ChatRequest) -> Value {
        let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
        for message in &request.messages {
            openai_messages(message, &mut messages);
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn parse_response(json: &Value) -> Result<ChatResponse, ProviderError> {
        let message = json
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0]".to_string()))?;

        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let raw_args = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str(raw_args).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Unparseable tool-call arguments");
                    json!({})
                });
                tool_calls.push(ToolCall {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments,
                });
            }
        }

        let prompt_tokens = json
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = json
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let total_tokens = json
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(prompt_tokens + completion_tokens);

        Ok(ChatResponse {
            text,
            tool_calls,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            },
        })
    }
}

/// Flatten one normalized message into OpenAI chat messages. Tool results
/// become `role: tool` messages keyed by the originating call id.
fn openai_messages(message: &ModelMessage, out: &mut Vec<Value>) {
    match message.role {
        MessageRole::System => {
            out.push(json!({"role": "system", "content": message.text()}));
        }
        MessageRole::Assistant => {
            let text = message.text();
            let tool_calls: Vec<Value> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    Content::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": input.to_string()},
                    })),
                    _ => None,
                })
                .collect();

            let mut msg = json!({"role": "assistant"});
            msg["content"] = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            out.push(msg);
        }
        MessageRole::User => {
            for block in &message.content {
                match block {
                    Content::ToolResult {
                        tool_use_id,
                        output,
                        ..
                    } => out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": output,
                    })),
                    Content::Text { text } => {
                        out.push(json!({"role": "user", "content": text}));
                    }
                    Content::ToolUse { .. } => {}
                }
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = Self::build_body(request);
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Self::parse_response(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ToolSpec;

    fn request_with_tool() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system_prompt: "be helpful".to_string(),
            messages: vec![
                ModelMessage::user("hi"),
                ModelMessage {
                    role: MessageRole::Assistant,
                    content: vec![Content::ToolUse {
                        id: "c1".to_string(),
                        name: "read_file".to_string(),
                        input: json!({"path": "a.txt"}),
                    }],
                },
                ModelMessage {
                    role: MessageRole::User,
                    content: vec![Content::ToolResult {
                        tool_use_id: "c1".to_string(),
                        output: "contents".to_string(),
                        is_error: false,
                    }],
                },
            ],
            tools: vec![ToolSpec {
                name: "read_file".to_string(),
                description: "read".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            temperature: 0.2,
            max_tokens: 64,
        }
    }

    #[test]
    fn anthropic_body_shape() {
        let body = AnthropicProvider::build_body(&request_with_tool());
        assert_eq!(body["system"], "be helpful");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(
            body["messages"][2]["content"][0]["tool_use_id"],
            "c1"
        );
        assert_eq!(body["tools"][0]["name"], "read_file");
    }

    #[test]
    fn anthropic_response_parsing() {
        let json = json!({
            "content": [
                {"type": "text", "text": "working on it"},
                {"type": "tool_use", "id": "c9", "name": "write_file", "input": {"path": "b"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let response = AnthropicProvider::parse_response(&json).unwrap();
        assert_eq!(response.text, "working on it");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "write_file");
        assert_eq!(response.usage.total_tokens, 19);
    }

    #[test]
    fn openai_body_shape() {
        let body = OpenAiProvider::build_body(&request_with_tool());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["type"], "function");
    }

    #[test]
    fn openai_response_parsing() {
        let json = json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "complete_task", "arguments": "{\"status\":\"completed\"}"}
                }]
            }}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        });
        let response = OpenAiProvider::parse_response(&json).unwrap();
        assert!(response.text.is_empty());
        assert_eq!(response.tool_calls[0].arguments["status"], "completed");
        assert_eq!(response.usage.total_tokens, 8);
    }

    #[test]
    fn http_error_classification() {
        assert!(ProviderError::Http {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(ProviderError::Http {
            status: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Http {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::InvalidResponse("bad".to_string()).is_retryable());
    }
}
