//! Test doubles shared by unit and integration tests.
//!
//! The scripted provider replays a queue of canned outcomes, letting tests
//! drive the agent runtime and workflow engine without any network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ai::provider::{Provider, ProviderError};
use crate::ai::types::{ChatRequest, ChatResponse, ToolCall};
use crate::task::TokenUsage;

/// One scripted provider outcome.
pub enum MockOutcome {
    Response(ChatResponse),
    Error(ProviderError),
}

/// Provider that pops one outcome per call, in order, recording every
/// request it sees. Running past the end of the script fails the test
/// loudly.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<MockOutcome>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request.clone());
        let outcome = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                MockOutcome::Error(ProviderError::InvalidResponse(
                    "scripted provider exhausted".to_string(),
                ))
            });
        match outcome {
            MockOutcome::Response(response) => Ok(response),
            MockOutcome::Error(err) => Err(err),
        }
    }
}

fn usage(prompt: u64, completion: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

/// A response that calls an arbitrary tool.
pub fn tool_call_response(name: &str, arguments: Value) -> MockOutcome {
    MockOutcome::Response(ChatResponse {
        text: String::new(),
        tool_calls: vec![ToolCall {
            id: format!("call-{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            arguments,
        }],
        usage: usage(50, 20),
    })
}

/// A response that finalizes the agent via `complete_task`.
pub fn complete_response(status: &str, summary: &str, content: &str) -> MockOutcome {
    complete_response_with(status, summary, content, json!({}))
}

/// `complete_task` response with extra payload fields (handoff/review notes).
pub fn complete_response_with(
    status: &str,
    summary: &str,
    content: &str,
    extra: Value,
) -> MockOutcome {
    let mut payload = json!({
        "status": status,
        "summary": summary,
        "content": content,
    });
    if let (Some(base), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    tool_call_response("complete_task", payload)
}

/// A plain-text response with no tool calls.
pub fn text_response(text: &str) -> MockOutcome {
    MockOutcome::Response(ChatResponse {
        text: text.to_string(),
        tool_calls: Vec::new(),
        usage: usage(30, 10),
    })
}
