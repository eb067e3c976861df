//! One-shot workspace review: git state, full diff, and a test run.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tools::shell::{run_process, shell_command};
use crate::tools::truncation::{truncate_middle, truncate_tail, DIFF_OUTPUT_CAP, TEST_OUTPUT_CAP};
use crate::tools::{parse_params, Tool, ToolContext, ToolResult};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_TEST_COMMAND: &str = "npm test";

pub struct ReviewWorkspaceTool;

#[derive(Deserialize)]
struct ReviewParams {
    #[serde(default, rename = "testCommand")]
    test_command: Option<String>,
}

#[async_trait]
impl Tool for ReviewWorkspaceTool {
    fn name(&self) -> &str {
        "review_workspace"
    }

    fn description(&self) -> &str {
        "Assemble a review snapshot: git status, diff stat, full diff, and the test suite output. Pass an empty testCommand to skip tests."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "testCommand": {
                    "type": "string",
                    "description": "Test command to run (default `npm test`, empty string skips)"
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<ReviewParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if ctx.cancellation.is_cancelled() {
            return ToolResult::error("Workspace review aborted: run cancelled");
        }

        let mut sections = Vec::with_capacity(4);

        let status = self.git(ctx, &["status", "--short"]).await;
        sections.push(format!("## Git Status\n\n```\n{status}\n```"));

        let stat = self.git(ctx, &["diff", "--stat"]).await;
        sections.push(format!("## Diff Stat\n\n```\n{stat}\n```"));

        let diff = self.git(ctx, &["diff"]).await;
        sections.push(format!(
            "## Diff\n\n```diff\n{}\n```",
            truncate_middle(&diff, DIFF_OUTPUT_CAP)
        ));

        let test_command = params
            .test_command
            .unwrap_or_else(|| DEFAULT_TEST_COMMAND.to_string());
        if test_command.is_empty() {
            sections.push("## Test Output\n\n(skipped)".to_string());
        } else {
            let body = match run_process(
                shell_command(&test_command, &ctx.working_dir),
                TEST_TIMEOUT,
                &ctx.cancellation,
            )
            .await
            {
                Ok(result) if result.cancelled => {
                    return ToolResult::error("Workspace review aborted: run cancelled");
                }
                Ok(result) => {
                    let tail = truncate_tail(&result.output, TEST_OUTPUT_CAP);
                    if result.timed_out {
                        format!(
                            "{tail}\n\n(test command timed out after {} s)",
                            TEST_TIMEOUT.as_secs()
                        )
                    } else {
                        format!("{tail}\n\nExit code: {}", result.exit_code)
                    }
                }
                Err(e) => format!("(failed to run tests: {e})"),
            };
            sections.push(format!("## Test Output (`{test_command}`)\n\n```\n{body}\n```"));
        }

        ToolResult::success(sections.join("\n\n"))
    }
}

impl ReviewWorkspaceTool {
    async fn git(&self, ctx: &ToolContext, args: &[&str]) -> String {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&ctx.working_dir);
        match run_process(cmd, GIT_TIMEOUT, &ctx.cancellation).await {
            Ok(result) if result.exit_code == 0 => {
                if result.output.trim().is_empty() {
                    "(clean)".to_string()
                } else {
                    result.output
                }
            }
            Ok(result) => format!("(git exited with {}: {})", result.exit_code, result.output),
            Err(e) => format!("(git unavailable: {e})"),
        }
    }
}
