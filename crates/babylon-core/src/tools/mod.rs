//! The tool surface agents invoke through function calling.
//!
//! Every tool takes decoded JSON arguments plus a [`ToolContext`] and
//! returns a [`ToolResult`]. Execution never throws into the agent loop:
//! all failures surface as `is_error = true` with a diagnostic message.

pub mod complete;
pub mod fs;
pub mod path;
pub mod registry;
pub mod review;
pub mod search;
pub mod shell;
pub mod truncation;

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancellation::CancellationHandle;

pub use registry::{registry_for_role, ToolRegistry};

/// Outcome of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: message.to_string(),
            is_error: true,
        }
    }
}

/// Execution context shared by all tools of one agent.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub agent_id: String,
    /// Absolute working-directory root. All paths resolve under it.
    pub working_dir: PathBuf,
    /// Path prefixes the planner assigned to this agent's task, if any.
    pub file_scope: Option<Vec<String>>,
    pub cancellation: CancellationHandle,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            task_id: String::new(),
            agent_id: String::new(),
            working_dir,
            file_scope: None,
            cancellation: CancellationHandle::new(),
        }
    }

    /// Resolve a user-supplied path under the workspace root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        path::resolve_in_root(&self.working_dir, raw)
    }
}

/// A named operation an agent may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema-like parameter spec.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// Decode tool parameters, converting serde errors into an error result.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::error(format!("Invalid parameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_reports_bad_arguments() {
        #[derive(serde::Deserialize, Debug)]
        struct Params {
            #[serde(rename = "path")]
            _path: String,
        }

        let err = parse_params::<Params>(serde_json::json!({"path": 7})).unwrap_err();
        assert!(err.is_error);
        assert!(err.content.contains("Invalid parameters"));
    }
}
