//! Filesystem tools: read_file, read_files, write_file, list_directory.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::tools::path::{in_file_scope, relative_display};
use crate::tools::truncation::{
    truncate_middle, GENERAL_OUTPUT_CAP, LISTING_OUTPUT_CAP, READ_FILES_PER_FILE_CAP,
    READ_FILES_TOTAL_CAP,
};
use crate::tools::{parse_params, Tool, ToolContext, ToolResult};

/// Directories never descended into by listing and search.
pub const SKIPPED_DIRS: [&str; 6] = ["node_modules", ".git", ".next", "dist", "build", ".babylon"];

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileParams {
    path: String,
    #[serde(default, rename = "startLine")]
    start_line: Option<usize>,
    #[serde(default, rename = "endLine")]
    end_line: Option<usize>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Optionally pass startLine/endLine (1-based, inclusive) to read a slice of a large file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "startLine": {"type": "number", "description": "First line to read (1-based)"},
                "endLine": {"type": "number", "description": "Last line to read (inclusive)"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<ReadFileParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let path = match ctx.resolve(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {e}", params.path)),
        };

        let output = match (params.start_line, params.end_line) {
            (None, None) => content,
            (start, end) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = start.unwrap_or(1).max(1);
                let end = end.unwrap_or(lines.len()).min(lines.len());
                if start > end || start > lines.len() {
                    return ToolResult::error(format!(
                        "Invalid line range {start}-{end} for a {}-line file",
                        lines.len()
                    ));
                }
                format!(
                    "[Lines {start}-{end}]\n{}",
                    lines[start - 1..end].join("\n")
                )
            }
        };

        ToolResult::success(truncate_middle(&output, GENERAL_OUTPUT_CAP))
    }
}

pub struct ReadFilesTool;

#[derive(Deserialize)]
struct ReadFilesParams {
    paths: Vec<String>,
}

#[async_trait]
impl Tool for ReadFilesTool {
    fn name(&self) -> &str {
        "read_files"
    }

    fn description(&self) -> &str {
        "Read up to 10 files in one call. Per-file failures are reported inline and never abort the batch."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Workspace-relative file paths (1..10)"
                }
            },
            "required": ["paths"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<ReadFilesParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if params.paths.is_empty() || params.paths.len() > 10 {
            return ToolResult::error(format!(
                "read_files takes between 1 and 10 paths, got {}",
                params.paths.len()
            ));
        }

        let mut blocks = Vec::with_capacity(params.paths.len());
        for raw in &params.paths {
            let body = match ctx.resolve(raw) {
                Ok(path) => match fs::read_to_string(&path).await {
                    Ok(content) => truncate_middle(&content, READ_FILES_PER_FILE_CAP),
                    Err(e) => format!("Error: failed to read: {e}"),
                },
                Err(e) => format!("Error: {e}"),
            };
            blocks.push(format!("--- {raw} ---\n{body}"));
        }

        ToolResult::success(truncate_middle(
            &blocks.join("\n\n"),
            READ_FILES_TOTAL_CAP,
        ))
    }
}

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteFileParams {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file. Parent directories are created as needed. Stay inside your assigned file scope."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Workspace-relative file path"},
                "content": {"type": "string", "description": "Full file contents"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<WriteFileParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let path = match ctx.resolve(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        // Warn-but-allow: out-of-scope writes are logged, not rejected. The
        // reviewer is responsible for flagging scope drift.
        let relative = relative_display(&ctx.working_dir, &path);
        if let Some(scope) = ctx.file_scope.as_deref() {
            if !scope.is_empty() && !in_file_scope(&relative, scope) {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    agent_id = %ctx.agent_id,
                    path = %relative,
                    scope = ?scope,
                    "write_file outside assigned file scope"
                );
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.exists()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create directory: {e}"));
            }
        }

        match fs::write(&path, &params.content).await {
            Ok(()) => ToolResult::success(format!(
                "Wrote {} bytes to {relative}",
                params.content.len()
            )),
            Err(e) => ToolResult::error(format!("Failed to write {}: {e}", params.path)),
        }
    }
}

pub struct ListDirectoryTool;

#[derive(Deserialize)]
struct ListDirectoryParams {
    #[serde(default)]
    path: Option<String>,
    #[serde(default, rename = "maxDepth")]
    max_depth: Option<usize>,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List directory entries as `d name` / `f name`. maxDepth (1..5) recurses with indentation. Build artifacts and VCS metadata are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list (default: workspace root)"},
                "maxDepth": {"type": "number", "description": "Recursion depth, 1..5 (default 1)"}
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<ListDirectoryParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let raw = params.path.as_deref().unwrap_or(".");
        let path = match ctx.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if !path.is_dir() {
            return ToolResult::error(format!("Not a directory: {raw}"));
        }

        let max_depth = params.max_depth.unwrap_or(1).clamp(1, 5);
        let mut lines = Vec::new();
        if let Err(e) = list_level(&path, 0, max_depth, &mut lines).await {
            return ToolResult::error(format!("Failed to list {raw}: {e}"));
        }

        if lines.is_empty() {
            return ToolResult::success("(empty directory)");
        }
        ToolResult::success(truncate_middle(&lines.join("\n"), LISTING_OUTPUT_CAP))
    }
}

/// Recursive listing with two-space indentation per level, directories
/// first, names sorted case-insensitively.
fn list_level<'a>(
    dir: &'a std::path::Path,
    depth: usize,
    max_depth: usize,
    lines: &'a mut Vec<String>,
) -> futures::future::BoxFuture<'a, std::io::Result<()>> {
    Box::pin(async move {
        let mut entries = Vec::new();
        let mut reader = fs::read_dir(dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|ft| ft.is_dir())
                .unwrap_or(false);
            entries.push((name, entry.path(), is_dir));
        }

        entries.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
        });

        let indent = "  ".repeat(depth);
        for (name, entry_path, is_dir) in entries {
            let kind = if is_dir { 'd' } else { 'f' };
            lines.push(format!("{indent}{kind} {name}"));
            if is_dir && depth + 1 < max_depth {
                list_level(&entry_path, depth + 1, max_depth, lines).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn context() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path().to_path_buf());
        (dir, ctx)
    }

    #[tokio::test]
    async fn read_file_round_trip() {
        let (dir, ctx) = context().await;
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();

        let result = ReadFileTool
            .execute(json!({"path": "a.txt"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("two"));
    }

    #[tokio::test]
    async fn read_file_slices_lines() {
        let (dir, ctx) = context().await;
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let result = ReadFileTool
            .execute(json!({"path": "a.txt", "startLine": 2, "endLine": 3}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.starts_with("[Lines 2-3]"));
        assert!(result.content.contains("two\nthree"));
        assert!(!result.content.contains("four"));
    }

    #[tokio::test]
    async fn read_file_rejects_escape_without_io() {
        let (_dir, ctx) = context().await;
        let result = ReadFileTool
            .execute(json!({"path": "../../etc/passwd"}), &ctx)
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("escapes"));
    }

    #[tokio::test]
    async fn read_files_reports_per_path_errors_inline() {
        let (dir, ctx) = context().await;
        std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();

        let result = ReadFilesTool
            .execute(json!({"paths": ["ok.txt", "missing.txt"]}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("--- ok.txt ---"));
        assert!(result.content.contains("fine"));
        assert!(result.content.contains("--- missing.txt ---"));
        assert!(result.content.contains("Error"));
    }

    #[tokio::test]
    async fn read_files_bounds_batch_size() {
        let (_dir, ctx) = context().await;
        let paths: Vec<String> = (0..11).map(|i| format!("f{i}.txt")).collect();
        let result = ReadFilesTool.execute(json!({ "paths": paths }), &ctx).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn write_file_creates_parents() {
        let (dir, ctx) = context().await;
        let result = WriteFileTool
            .execute(json!({"path": "nested/deep/file.txt", "content": "data"}), &ctx)
            .await;
        assert!(!result.is_error);
        let written = std::fs::read_to_string(dir.path().join("nested/deep/file.txt")).unwrap();
        assert_eq!(written, "data");
    }

    #[tokio::test]
    async fn write_file_out_of_scope_still_writes() {
        let (dir, mut ctx) = context().await;
        ctx.file_scope = Some(vec!["src/".to_string()]);

        let result = WriteFileTool
            .execute(json!({"path": "docs/out.md", "content": "x"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(dir.path().join("docs/out.md").exists());
    }

    #[tokio::test]
    async fn write_file_refuses_reserved_dir() {
        let (dir, ctx) = context().await;
        let result = WriteFileTool
            .execute(json!({"path": ".babylon/tasks/x.json", "content": "x"}), &ctx)
            .await;
        assert!(result.is_error);
        assert!(!dir.path().join(".babylon").exists());
    }

    #[tokio::test]
    async fn list_directory_skips_artifacts_and_indents() {
        let (dir, ctx) = context().await;
        std::fs::create_dir_all(dir.path().join("src/api")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/junk")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let result = ListDirectoryTool
            .execute(json!({"maxDepth": 3}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("d src"));
        assert!(result.content.contains("  d api"));
        assert!(result.content.contains("  f main.rs"));
        assert!(result.content.contains("f README.md"));
        assert!(!result.content.contains("node_modules"));
    }
}
