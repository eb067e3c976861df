//! Termination signal tool. Validation happens in the agent runtime; the
//! tool only echoes the payload back as the tool result.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolContext, ToolResult};

pub struct CompleteTaskTool;

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }

    fn description(&self) -> &str {
        "Finish your assignment. Call exactly once, with your final status, a one-paragraph summary, and the full result content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["completed", "failed", "needs_review"],
                    "description": "Final status of your assignment"
                },
                "summary": {"type": "string", "description": "Short summary of what was done"},
                "content": {"type": "string", "description": "Full result payload (JSON where your role requires it)"},
                "handoff_notes": {"type": "string", "description": "Notes for the next agent in the pipeline"},
                "review_notes": {"type": "string", "description": "Issues found, for the revision pass"},
                "metadata": {"type": "object", "description": "Free-form additional metadata"}
            },
            "required": ["status", "summary", "content"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::success(params.to_string())
    }
}
