//! Shell execution tools and the command safety policy.
//!
//! `run_terminal_command` executes non-interactive commands with a timeout
//! and a blocklist that rejects destructive patterns before any process is
//! spawned. `git_operations` and `invoke_cursor_cli` share the same process
//! plumbing.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::cancellation::CancellationHandle;
use crate::tools::truncation::{truncate_middle, GENERAL_OUTPUT_CAP};
use crate::tools::{parse_params, Tool, ToolContext, ToolResult};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const CURSOR_CLI_TIMEOUT: Duration = Duration::from_secs(300);

static FORK_BOMB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:").expect("valid regex"));
static ANSI_ESCAPES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("valid regex")
});
static INTERACTIVE_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\[y/n\]|\[n/y\]|\(y/n\)|continue\?|password:|>\s*$)").expect("valid regex")
});

/// Split a command line into segments at unquoted `;`, `|`, `&&`, `||`.
/// Quoting and escapes are respected so quoted text never triggers the
/// segment-level rules.
fn split_shell_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => {
                current.push(ch);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            ';' if !in_single && !in_double => {
                push_segment(&mut segments, &mut current);
            }
            '|' | '&' if !in_single && !in_double => {
                if matches!(chars.peek(), Some(next) if *next == ch) {
                    let _ = chars.next();
                }
                push_segment(&mut segments, &mut current);
            }
            _ => current.push(ch),
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

fn tokenize(segment: &str) -> Vec<String> {
    shell_words::split(segment).unwrap_or_else(|_| {
        segment
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    })
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((key, _)) => {
            !key.is_empty() && key.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn strip_env_prefix(tokens: &[String]) -> &[String] {
    let mut idx = 0;
    while idx < tokens.len() && is_env_assignment(&tokens[idx]) {
        idx += 1;
    }
    &tokens[idx..]
}

fn is_destructive_rm(tokens: &[String]) -> bool {
    let flags: Vec<&String> = tokens.iter().skip(1).filter(|t| t.starts_with('-')).collect();
    let has_recursive = flags.iter().any(|t| t.contains('r') || t.contains('R'));
    let has_force = flags.iter().any(|t| t.contains('f'));
    if !(has_recursive && has_force) {
        return false;
    }
    tokens
        .iter()
        .skip(1)
        .filter(|t| !t.starts_with('-'))
        .any(|target| {
            matches!(
                target.as_str(),
                "/" | "/*" | "~" | "~/" | "$HOME" | "${HOME}"
            )
        })
}

/// Why a command is blocked, if it is.
pub fn blocked_reason(command: &str) -> Option<String> {
    if FORK_BOMB.is_match(command) {
        return Some("fork bomb".to_string());
    }

    for segment in split_shell_segments(command) {
        let tokens = tokenize(&segment);
        let tokens = strip_env_prefix(&tokens);
        let Some(program) = tokens.first().map(|t| t.to_ascii_lowercase()) else {
            continue;
        };

        match program.as_str() {
            "rm" if is_destructive_rm(tokens) => {
                return Some("destructive rm target".to_string());
            }
            "sudo" | "doas" => {
                if tokens.get(1).map(|t| t.as_str()) == Some("rm") {
                    return Some("sudo rm".to_string());
                }
            }
            "git" => {
                let is_push = tokens.get(1).map(|t| t.as_str()) == Some("push");
                let forced = tokens
                    .iter()
                    .any(|t| t == "-f" || t == "--force" || t == "--force-with-lease");
                if is_push && forced {
                    return Some("git force push".to_string());
                }
            }
            "npm" => {
                if tokens.iter().skip(1).any(|t| t == "publish") {
                    return Some("npm publish".to_string());
                }
            }
            "npx" => {
                if tokens.iter().skip(1).any(|t| t == "publish") {
                    return Some("npx publish".to_string());
                }
            }
            "dd" => {
                if tokens.iter().skip(1).any(|t| t.starts_with("if=")) {
                    return Some("raw dd transfer".to_string());
                }
            }
            _ if program.starts_with("mkfs") => {
                return Some("filesystem formatting".to_string());
            }
            _ => {}
        }
    }
    None
}

/// Commands that never exit on their own (dev servers, watchers). These are
/// rejected with an advisory instead of hanging until the timeout.
pub fn non_terminating_reason(command: &str) -> Option<String> {
    for segment in split_shell_segments(command) {
        let tokens = tokenize(&segment);
        let tokens = strip_env_prefix(&tokens);
        let Some(program) = tokens.first().map(|t| t.to_ascii_lowercase()) else {
            continue;
        };
        let second = tokens.get(1).map(|t| t.to_ascii_lowercase());

        let name = match (program.as_str(), second.as_deref()) {
            ("npm", Some("start")) => Some("npm start"),
            ("npm", Some("run")) if tokens.get(2).map(|t| t.as_str()) == Some("dev") => {
                Some("npm run dev")
            }
            ("yarn", Some("dev")) => Some("yarn dev"),
            ("yarn", Some("start")) => Some("yarn start"),
            ("next", Some("dev")) => Some("next dev"),
            ("vite", _) => Some("vite"),
            ("ts-node-dev", _) => Some("ts-node-dev"),
            ("nodemon", _) => Some("nodemon"),
            ("http-server", _) => Some("http-server"),
            _ if program.ends_with("watch") => Some("watch mode"),
            _ if tokens.iter().any(|t| t == "--watch") => Some("watch mode"),
            _ => None,
        };
        if let Some(name) = name {
            return Some(name.to_string());
        }
    }
    None
}

fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPES.replace_all(text, "").into_owned()
}

/// Result of an external process run.
pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Spawn and wait for a process with timeout and cancellation. Output is
/// combined stdout + stderr with ANSI escapes removed.
pub(crate) async fn run_process(
    mut command: Command,
    timeout: Duration,
    cancellation: &CancellationHandle,
) -> Result<CommandOutput, String> {
    command
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to spawn command: {e}"))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let mut timed_out = false;
    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
        _ = cancellation.cancelled() => {
            cancelled = true;
            None
        }
    };

    let status = match status {
        Some(status) => Some(status),
        None => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let mut output = String::from_utf8_lossy(&stdout).into_owned();
    let stderr_text = String::from_utf8_lossy(&stderr);
    if !stderr_text.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&stderr_text);
    }

    Ok(CommandOutput {
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
        output: strip_ansi(&output),
        timed_out,
        cancelled,
    })
}

pub(crate) fn shell_command(command_line: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line).current_dir(cwd);
    cmd
}

fn render_output(result: &CommandOutput) -> String {
    let mut body = truncate_middle(&result.output, GENERAL_OUTPUT_CAP);
    if INTERACTIVE_PROMPT.is_match(result.output.trim_end()) {
        body.push_str(
            "\n\n[hint] The command appears to be waiting for interactive input. \
             Re-run it non-interactively (pipe input, or pass a flag such as -y).",
        );
    }
    body.push_str(&format!("\n\nExit code: {}", result.exit_code));
    body
}

pub struct RunTerminalCommandTool;

#[derive(Deserialize)]
struct RunCommandParams {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

#[async_trait]
impl Tool for RunTerminalCommandTool {
    fn name(&self) -> &str {
        "run_terminal_command"
    }

    fn description(&self) -> &str {
        "Execute a non-interactive shell command in the workspace (120 s timeout). Long-running dev servers and watchers are rejected; run one-shot commands instead."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run"},
                "cwd": {"type": "string", "description": "Workspace-relative working directory"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<RunCommandParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if let Some(reason) = blocked_reason(&params.command) {
            tracing::warn!(command = %params.command, reason = %reason, "Blocked dangerous command");
            return ToolResult::error(format!(
                "Command blocked by safety policy ({reason}). It was not executed."
            ));
        }
        if let Some(name) = non_terminating_reason(&params.command) {
            return ToolResult::error(format!(
                "Command rejected: `{name}` does not terminate on its own. \
                 Use a one-shot alternative (build, test, lint) instead."
            ));
        }

        let cwd = match params.cwd.as_deref() {
            Some(raw) => match ctx.resolve(raw) {
                Ok(p) => p,
                Err(e) => return ToolResult::error(e),
            },
            None => ctx.working_dir.clone(),
        };

        tracing::info!(command = %params.command, "Executing terminal command");
        let result = match run_process(
            shell_command(&params.command, &cwd),
            COMMAND_TIMEOUT,
            &ctx.cancellation,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e),
        };

        if result.cancelled {
            return ToolResult::error("Command aborted: run cancelled");
        }
        if result.timed_out {
            return ToolResult::error(format!(
                "Command timed out after {} s\n{}",
                COMMAND_TIMEOUT.as_secs(),
                truncate_middle(&result.output, GENERAL_OUTPUT_CAP)
            ));
        }

        let body = render_output(&result);
        if result.exit_code == 0 {
            ToolResult::success(body)
        } else {
            ToolResult::error(body)
        }
    }
}

pub struct GitOperationsTool;

const GIT_OPERATIONS: [&str; 8] = [
    "status", "branch", "checkout", "add", "commit", "diff", "log", "merge",
];

#[derive(Deserialize)]
struct GitParams {
    operation: String,
    #[serde(default)]
    args: Option<String>,
}

#[async_trait]
impl Tool for GitOperationsTool {
    fn name(&self) -> &str {
        "git_operations"
    }

    fn description(&self) -> &str {
        "Run a git operation (status, branch, checkout, add, commit, diff, log, merge) in the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": GIT_OPERATIONS,
                    "description": "Git subcommand"
                },
                "args": {"type": "string", "description": "Additional arguments"}
            },
            "required": ["operation"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<GitParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if !GIT_OPERATIONS.contains(&params.operation.as_str()) {
            return ToolResult::error(format!(
                "Unsupported git operation '{}'. Allowed: {}",
                params.operation,
                GIT_OPERATIONS.join(", ")
            ));
        }

        let extra = match params.args.as_deref().map(shell_words::split).transpose() {
            Ok(args) => args.unwrap_or_default(),
            Err(e) => return ToolResult::error(format!("Unparseable git arguments: {e}")),
        };

        let mut cmd = Command::new("git");
        cmd.arg(&params.operation)
            .args(&extra)
            .current_dir(&ctx.working_dir);

        let result = match run_process(cmd, COMMAND_TIMEOUT, &ctx.cancellation).await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e),
        };

        if result.cancelled {
            return ToolResult::error("Git operation aborted: run cancelled");
        }
        let body = render_output(&result);
        if result.exit_code == 0 {
            ToolResult::success(body)
        } else {
            ToolResult::error(body)
        }
    }
}

pub struct InvokeCursorCliTool;

#[derive(Deserialize)]
struct CursorCliParams {
    prompt: String,
    #[serde(default)]
    cli: Option<String>,
}

#[async_trait]
impl Tool for InvokeCursorCliTool {
    fn name(&self) -> &str {
        "invoke_cursor_cli"
    }

    fn description(&self) -> &str {
        "Delegate a focused sub-task to an external coding-assistant CLI (claude or cursor). Expensive; prefer direct edits for small changes."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Instructions for the external assistant"},
                "cli": {"type": "string", "enum": ["cursor", "claude"], "description": "Which assistant binary (default claude)"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<CursorCliParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let program = match params.cli.as_deref().unwrap_or("claude") {
            "claude" => "claude",
            "cursor" => "cursor-agent",
            other => {
                return ToolResult::error(format!(
                    "Unknown cli '{other}'. Allowed: cursor, claude"
                ))
            }
        };

        let mut cmd = Command::new(program);
        cmd.arg("-p")
            .arg(&params.prompt)
            .current_dir(&ctx.working_dir);

        let result = match run_process(cmd, CURSOR_CLI_TIMEOUT, &ctx.cancellation).await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(e),
        };

        if result.cancelled {
            return ToolResult::error("CLI invocation aborted: run cancelled");
        }
        if result.timed_out {
            return ToolResult::error(format!(
                "CLI invocation timed out after {} s",
                CURSOR_CLI_TIMEOUT.as_secs()
            ));
        }
        let body = render_output(&result);
        if result.exit_code == 0 {
            ToolResult::success(body)
        } else {
            ToolResult::error(body)
        }
    }
}
