//! The agent runtime: one role-playing agent driven to completion.
//!
//! Owns the conversation with the LLM, dispatches tool calls in order,
//! accumulates token usage, detects stuck loops, retries transient provider
//! errors, enforces the turn budget and finalizes on `complete_task`.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ai::retry::call_with_retry;
use crate::ai::types::{ChatRequest, Content, MessageRole, ModelMessage, ToolCall};
use crate::ai::Provider;
use crate::cancellation::CancellationHandle;
use crate::events::{EventBus, WorkflowEvent};
use crate::roles::Role;
use crate::task::{Artifact, TokenUsage};
use crate::tools::{ToolContext, ToolRegistry, ToolResult};

/// Identical consecutive tool-call sequences before the loop is broken.
const MAX_CONSECUTIVE_DUPLICATES: u32 = 3;
/// Display cap for `agent:content` events.
const CONTENT_DISPLAY_CAP: usize = 2_000;
/// Display cap for sanitized tool-call argument strings.
const ARGUMENT_DISPLAY_CAP: usize = 400;

const FINAL_TURN_NUDGE: &str =
    "This is your FINAL turn. You MUST call complete_task now with your best result so far.";

/// Terminal status of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    NeedsReview,
}

impl AgentStatus {
    fn from_payload(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(AgentStatus::Completed),
            "failed" => Some(AgentStatus::Failed),
            "needs_review" => Some(AgentStatus::NeedsReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::NeedsReview => "needs_review",
        };
        f.write_str(s)
    }
}

/// Configuration for one agent invocation.
#[derive(Clone)]
pub struct AgentConfig {
    pub role: Role,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_turns: u32,
    /// Sliding-window cap: keep the first user message plus the suffix from
    /// the Nth-from-last assistant message. `None` sends everything.
    pub max_context_turns: Option<usize>,
}

/// Result of running one agent.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent_id: String,
    pub role: Role,
    pub status: AgentStatus,
    pub artifact: Artifact,
    pub usage: TokenUsage,
    pub conversation: Vec<ModelMessage>,
}

pub struct AgentRuntime {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    config: AgentConfig,
    bus: Arc<EventBus>,
    cancellation: CancellationHandle,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        config: AgentConfig,
        bus: Arc<EventBus>,
        cancellation: CancellationHandle,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
            bus,
            cancellation,
        }
    }

    /// Drive the agent to completion.
    pub async fn run(
        &self,
        step_id: &str,
        initial_context: &str,
        tool_ctx: &ToolContext,
    ) -> AgentResult {
        let agent_id = Uuid::new_v4().to_string();
        let mut tool_ctx = tool_ctx.clone();
        tool_ctx.agent_id = agent_id.clone();

        self.bus.publish(WorkflowEvent::AgentSpawn {
            agent_id: agent_id.clone(),
            step_id: step_id.to_string(),
            role: self.config.role,
        });

        let mut messages = vec![ModelMessage::user(initial_context)];
        let mut usage = TokenUsage::default();
        let mut last_signature: Option<Vec<(String, String)>> = None;
        let mut duplicate_turns = 0u32;

        for turn in 1..=self.config.max_turns {
            if self.cancellation.is_cancelled() {
                return self.finalize(
                    &agent_id,
                    AgentStatus::Failed,
                    "Aborted by user",
                    usage,
                    messages,
                );
            }

            self.bus.publish(WorkflowEvent::AgentTurn {
                agent_id: agent_id.clone(),
                turn,
                max_turns: self.config.max_turns,
            });

            if turn == self.config.max_turns {
                messages.push(ModelMessage::user(FINAL_TURN_NUDGE));
            }

            let request = self.build_request(&messages);
            let response =
                match call_with_retry(self.provider.as_ref(), &request, &self.cancellation).await {
                    Ok(response) => response,
                    Err(e) => {
                        return self.finalize(
                            &agent_id,
                            AgentStatus::Failed,
                            &format!("LLM call failed: {e}"),
                            usage,
                            messages,
                        );
                    }
                };

            usage.add(response.usage);
            self.bus.publish(WorkflowEvent::TokenUpdate {
                agent_id: agent_id.clone(),
                role: self.config.role,
                model: self.config.model.clone(),
                usage: response.usage,
                cumulative: usage,
            });

            let assistant = build_assistant_message(&response.text, &response.tool_calls);
            if !assistant.content.is_empty() {
                messages.push(assistant);
            }
            if !response.text.is_empty() {
                self.bus.publish(WorkflowEvent::AgentContent {
                    agent_id: agent_id.clone(),
                    content: clip_chars(&response.text, CONTENT_DISPLAY_CAP),
                });
            }

            // The model may still be reasoning in plain text.
            if response.tool_calls.is_empty() {
                continue;
            }

            let signature: Vec<(String, String)> = response
                .tool_calls
                .iter()
                .map(|c| (c.name.clone(), c.arguments.to_string()))
                .collect();
            if last_signature.as_ref() == Some(&signature) {
                duplicate_turns += 1;
            } else {
                duplicate_turns = 1;
                last_signature = Some(signature);
            }
            if duplicate_turns >= MAX_CONSECUTIVE_DUPLICATES {
                return self.finalize(
                    &agent_id,
                    AgentStatus::NeedsReview,
                    "Agent appeared stuck in a loop",
                    usage,
                    messages,
                );
            }

            let mut results: Vec<Content> = Vec::with_capacity(response.tool_calls.len());
            let mut invalid_completion = false;
            for call in &response.tool_calls {
                self.bus.publish(WorkflowEvent::AgentToolCall {
                    agent_id: agent_id.clone(),
                    name: call.name.clone(),
                    arguments: sanitize_arguments(&call.arguments),
                });

                if call.name == "complete_task" {
                    match validate_completion(&call.arguments) {
                        Ok(completion) => {
                            results.push(tool_result_block(call, &call.arguments.to_string(), false));
                            messages.push(ModelMessage {
                                role: MessageRole::User,
                                content: results,
                            });
                            self.bus.publish(WorkflowEvent::AgentToolResult {
                                agent_id: agent_id.clone(),
                                name: call.name.clone(),
                                is_error: false,
                                duration_ms: 0,
                            });
                            return self.finalize_completed(
                                &agent_id,
                                completion,
                                usage,
                                messages,
                            );
                        }
                        Err(problem) => {
                            invalid_completion = true;
                            results.push(tool_result_block(call, &problem, true));
                            self.bus.publish(WorkflowEvent::AgentToolResult {
                                agent_id: agent_id.clone(),
                                name: call.name.clone(),
                                is_error: true,
                                duration_ms: 0,
                            });
                            continue;
                        }
                    }
                }

                let started = Instant::now();
                let result = match self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &tool_ctx)
                    .await
                {
                    Some(result) => result,
                    None => ToolResult::error(format!("Unknown tool: {}", call.name)),
                };
                let duration_ms = started.elapsed().as_millis() as u64;

                self.bus.publish(WorkflowEvent::AgentToolResult {
                    agent_id: agent_id.clone(),
                    name: call.name.clone(),
                    is_error: result.is_error,
                    duration_ms,
                });
                results.push(tool_result_block(call, &result.content, result.is_error));
            }

            messages.push(ModelMessage {
                role: MessageRole::User,
                content: results,
            });
            if invalid_completion {
                messages.push(ModelMessage::user(
                    "Your complete_task call was invalid. Call complete_task again with \
                     status (completed|failed|needs_review), a non-empty summary and \
                     non-empty content.",
                ));
            }
        }

        self.finalize(
            &agent_id,
            AgentStatus::NeedsReview,
            "Agent reached maximum turns without completing",
            usage,
            messages,
        )
    }

    fn build_request(&self, messages: &[ModelMessage]) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            messages: trim_context(messages, self.config.max_context_turns),
            tools: self.tools.specs(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Conversation log as configured: one system message, then the live
    /// message history.
    fn full_conversation(&self, messages: Vec<ModelMessage>) -> Vec<ModelMessage> {
        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(ModelMessage::system(self.config.system_prompt.clone()));
        conversation.extend(messages);
        conversation
    }

    fn finalize_completed(
        &self,
        agent_id: &str,
        completion: Completion,
        usage: TokenUsage,
        conversation: Vec<ModelMessage>,
    ) -> AgentResult {
        let mut artifact = Artifact::new(self.config.role.artifact_type(), completion.content);
        if let Some(notes) = completion.handoff_notes {
            artifact
                .metadata
                .insert("handoff_notes".to_string(), Value::String(notes));
        }
        if let Some(notes) = completion.review_notes {
            artifact
                .metadata
                .insert("review_notes".to_string(), Value::String(notes));
        }
        if let Some(extra) = completion.metadata {
            for (key, value) in extra {
                artifact.metadata.entry(key).or_insert(value);
            }
        }
        artifact
            .metadata
            .insert("summary".to_string(), Value::String(completion.summary.clone()));

        self.bus.publish(WorkflowEvent::AgentComplete {
            agent_id: agent_id.to_string(),
            role: self.config.role,
            status: completion.status,
            summary: completion.summary,
        });

        AgentResult {
            agent_id: agent_id.to_string(),
            role: self.config.role,
            status: completion.status,
            artifact,
            usage,
            conversation: self.full_conversation(conversation),
        }
    }

    fn finalize(
        &self,
        agent_id: &str,
        status: AgentStatus,
        reason: &str,
        usage: TokenUsage,
        conversation: Vec<ModelMessage>,
    ) -> AgentResult {
        self.bus.publish(WorkflowEvent::AgentComplete {
            agent_id: agent_id.to_string(),
            role: self.config.role,
            status,
            summary: reason.to_string(),
        });

        let mut artifact = Artifact::new(self.config.role.artifact_type(), reason);
        artifact
            .metadata
            .insert("summary".to_string(), Value::String(reason.to_string()));

        AgentResult {
            agent_id: agent_id.to_string(),
            role: self.config.role,
            status,
            artifact,
            usage,
            conversation: self.full_conversation(conversation),
        }
    }
}

struct Completion {
    status: AgentStatus,
    summary: String,
    content: String,
    handoff_notes: Option<String>,
    review_notes: Option<String>,
    metadata: Option<serde_json::Map<String, Value>>,
}

/// Validate a `complete_task` payload. The agent gets one corrective chance
/// per invalid call.
fn validate_completion(arguments: &Value) -> Result<Completion, String> {
    let status = arguments
        .get("status")
        .and_then(Value::as_str)
        .and_then(AgentStatus::from_payload)
        .ok_or("complete_task requires status = completed | failed | needs_review")?;

    let summary = arguments
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("complete_task requires a non-empty summary")?;

    let content = arguments
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("complete_task requires non-empty content")?;

    Ok(Completion {
        status,
        summary: summary.to_string(),
        content: content.to_string(),
        handoff_notes: arguments
            .get("handoff_notes")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        review_notes: arguments
            .get("review_notes")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        metadata: arguments
            .get("metadata")
            .and_then(Value::as_object)
            .cloned(),
    })
}

fn build_assistant_message(text: &str, tool_calls: &[ToolCall]) -> ModelMessage {
    let mut content = Vec::with_capacity(tool_calls.len() + usize::from(!text.is_empty()));
    if !text.is_empty() {
        content.push(Content::Text {
            text: text.to_string(),
        });
    }
    for call in tool_calls {
        content.push(Content::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        });
    }
    ModelMessage {
        role: MessageRole::Assistant,
        content,
    }
}

fn tool_result_block(call: &ToolCall, output: &str, is_error: bool) -> Content {
    Content::ToolResult {
        tool_use_id: call.id.clone(),
        output: output.to_string(),
        is_error,
    }
}

fn clip_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(cap).collect();
    clipped.push('…');
    clipped
}

/// Ellipsize long strings inside tool-call arguments for display events.
fn sanitize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(s) if s.chars().count() > ARGUMENT_DISPLAY_CAP => {
            Value::String(clip_chars(s, ARGUMENT_DISPLAY_CAP))
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_arguments).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_arguments(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Sliding-window context: keep the first user message and the suffix
/// starting at the Nth-from-last assistant message.
fn trim_context(messages: &[ModelMessage], max_context_turns: Option<usize>) -> Vec<ModelMessage> {
    let Some(window) = max_context_turns.filter(|n| *n > 0) else {
        return messages.to_vec();
    };

    let assistant_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Assistant)
        .map(|(i, _)| i)
        .collect();

    if assistant_indices.len() <= window {
        return messages.to_vec();
    }

    let cut = assistant_indices[assistant_indices.len() - window];
    if cut <= 1 {
        return messages.to_vec();
    }

    let mut trimmed = vec![messages[0].clone()];
    trimmed.extend_from_slice(&messages[cut..]);
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleDefaults;
    use crate::task::ArtifactType;
    use crate::test_support::{
        complete_response, complete_response_with, text_response, tool_call_response, MockOutcome,
        ScriptedProvider,
    };
    use crate::tools::registry_for_role;
    use serde_json::json;
    use std::sync::Mutex;

    fn runtime_with(
        script: Vec<MockOutcome>,
        role: Role,
        max_turns: u32,
    ) -> (AgentRuntime, Arc<EventBus>, tempfile::TempDir) {
        let provider = Arc::new(ScriptedProvider::new(script));
        let defaults = RoleDefaults::for_role(role);
        let config = AgentConfig {
            role,
            system_prompt: "test prompt".to_string(),
            model: "test-model".to_string(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            max_turns,
            max_context_turns: None,
        };
        let bus = Arc::new(EventBus::new());
        let dir = tempfile::tempdir().unwrap();
        let runtime = AgentRuntime::new(
            provider,
            registry_for_role(role, false),
            config,
            Arc::clone(&bus),
            CancellationHandle::new(),
        );
        (runtime, bus, dir)
    }

    fn tool_ctx(dir: &tempfile::TempDir) -> ToolContext {
        ToolContext::new(dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn completes_on_complete_task() {
        let (runtime, _bus, dir) = runtime_with(
            vec![complete_response("completed", "done", "all good")],
            Role::Executor,
            5,
        );
        let result = runtime.run("step-1", "do the thing", &tool_ctx(&dir)).await;

        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(result.artifact.artifact_type, ArtifactType::CodeChanges);
        assert_eq!(result.artifact.content, "all good");
        assert!(result.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn attaches_notes_to_artifact_metadata() {
        let (runtime, _bus, dir) = runtime_with(
            vec![complete_response_with(
                "needs_review",
                "found issues",
                "details",
                json!({"review_notes": "Missing validation on field X"}),
            )],
            Role::Reviewer,
            5,
        );
        let result = runtime.run("step-1", "review it", &tool_ctx(&dir)).await;

        assert_eq!(result.status, AgentStatus::NeedsReview);
        assert_eq!(
            result.artifact.review_notes(),
            Some("Missing validation on field X")
        );
    }

    #[tokio::test]
    async fn stuck_loop_breaks_with_needs_review() {
        let same_call = || tool_call_response("list_directory", json!({"path": "."}));
        let (runtime, _bus, dir) = runtime_with(
            vec![same_call(), same_call(), same_call(), same_call()],
            Role::Analyzer,
            5,
        );
        let result = runtime.run("step-1", "analyze", &tool_ctx(&dir)).await;

        assert_eq!(result.status, AgentStatus::NeedsReview);
        assert!(result.artifact.content.contains("stuck"));
        // The remaining turn budget is not consumed: three turns' worth of
        // messages at most, not five.
        assert!(result.conversation.len() <= 2 * 3 + 2);
    }

    #[tokio::test]
    async fn varied_calls_do_not_trip_stuck_detection() {
        let (runtime, _bus, dir) = runtime_with(
            vec![
                tool_call_response("list_directory", json!({"path": "."})),
                tool_call_response("list_directory", json!({"path": "src"})),
                tool_call_response("list_directory", json!({"path": "."})),
                complete_response("completed", "ok", "analysis"),
            ],
            Role::Analyzer,
            6,
        );
        let result = runtime.run("step-1", "analyze", &tool_ctx(&dir)).await;
        assert_eq!(result.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn final_turn_nudge_is_sent() {
        // Two plain-text turns against max_turns = 2: the nudge must appear
        // in the conversation before the last call.
        let (runtime, _bus, dir) = runtime_with(
            vec![text_response("thinking..."), text_response("still thinking")],
            Role::Analyzer,
            2,
        );
        let result = runtime.run("step-1", "analyze", &tool_ctx(&dir)).await;

        assert_eq!(result.status, AgentStatus::NeedsReview);
        assert!(result.artifact.content.contains("maximum turns"));
        let nudged = result
            .conversation
            .iter()
            .any(|m| m.role == MessageRole::User && m.text().contains("FINAL turn"));
        assert!(nudged, "final-turn nudge missing from conversation");
    }

    #[tokio::test]
    async fn invalid_completion_gets_one_corrective_chance() {
        let (runtime, _bus, dir) = runtime_with(
            vec![
                tool_call_response("complete_task", json!({"status": "completed"})),
                complete_response("completed", "done", "content"),
            ],
            Role::Executor,
            5,
        );
        let result = runtime.run("step-1", "do it", &tool_ctx(&dir)).await;

        assert_eq!(result.status, AgentStatus::Completed);
        let corrected = result
            .conversation
            .iter()
            .any(|m| m.text().contains("complete_task again"));
        assert!(corrected, "corrective user message missing");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_fatal() {
        let (runtime, bus, dir) = runtime_with(
            vec![
                tool_call_response("teleport", json!({})),
                complete_response("completed", "done", "content"),
            ],
            Role::Executor,
            5,
        );

        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            bus.subscribe(move |event| {
                if let WorkflowEvent::AgentToolResult { name, is_error, .. } = event {
                    errors.lock().unwrap().push((name.clone(), *is_error));
                }
            });
        }

        let result = runtime.run("step-1", "do it", &tool_ctx(&dir)).await;
        assert_eq!(result.status, AgentStatus::Completed);
        let errors = errors.lock().unwrap();
        assert!(errors.iter().any(|(name, is_error)| name == "teleport" && *is_error));
    }

    #[tokio::test]
    async fn cancellation_fails_fast() {
        let (runtime, _bus, dir) = runtime_with(
            vec![complete_response("completed", "done", "content")],
            Role::Executor,
            5,
        );
        runtime.cancellation.cancel();
        let result = runtime.run("step-1", "do it", &tool_ctx(&dir)).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.artifact.content.contains("Aborted"));
    }

    #[tokio::test]
    async fn permanent_provider_error_fails_agent() {
        let (runtime, _bus, dir) = runtime_with(
            vec![MockOutcome::Error(crate::ai::ProviderError::Http {
                status: 400,
                message: "bad request".to_string(),
            })],
            Role::Executor,
            5,
        );
        let result = runtime.run("step-1", "do it", &tool_ctx(&dir)).await;
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(result.artifact.content.contains("LLM call failed"));
    }

    #[test]
    fn context_trimming_keeps_anchor_and_suffix() {
        let mut messages = vec![ModelMessage::user("initial context")];
        for i in 0..6 {
            messages.push(ModelMessage {
                role: MessageRole::Assistant,
                content: vec![Content::Text {
                    text: format!("assistant {i}"),
                }],
            });
            messages.push(ModelMessage::user(format!("tool results {i}")));
        }

        let trimmed = trim_context(&messages, Some(2));
        assert_eq!(trimmed[0].text(), "initial context");
        assert!(trimmed[1].text().contains("assistant 4"));
        assert_eq!(trimmed.len(), 1 + 4);

        let untrimmed = trim_context(&messages, None);
        assert_eq!(untrimmed.len(), messages.len());
    }

    #[test]
    fn sanitize_ellipsizes_long_strings() {
        let long = "x".repeat(1000);
        let sanitized = sanitize_arguments(&json!({"content": long, "n": 4}));
        let content = sanitized["content"].as_str().unwrap();
        assert!(content.chars().count() <= ARGUMENT_DISPLAY_CAP + 1);
        assert!(content.ends_with('…'));
        assert_eq!(sanitized["n"], 4);
    }

    #[test]
    fn completion_validation_rules() {
        assert!(validate_completion(&json!({
            "status": "completed", "summary": "s", "content": "c"
        }))
        .is_ok());
        assert!(validate_completion(&json!({"status": "perfect", "summary": "s", "content": "c"})).is_err());
        assert!(validate_completion(&json!({"status": "completed", "summary": "", "content": "c"})).is_err());
        assert!(validate_completion(&json!({"status": "completed", "summary": "s"})).is_err());
    }
}
