//! Workspace text search.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::fs::SKIPPED_DIRS;
use crate::tools::truncation::{truncate_middle, SEARCH_OUTPUT_CAP};
use crate::tools::{parse_params, Tool, ToolContext, ToolResult};

const MAX_FILES_VISITED: usize = 300;
const MAX_RESULTS_CAP: usize = 500;
const DEFAULT_MAX_RESULTS: usize = 150;

pub struct SearchInFilesTool;

#[derive(Deserialize)]
struct SearchParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default, rename = "maxResults")]
    max_results: Option<usize>,
}

#[async_trait]
impl Tool for SearchInFilesTool {
    fn name(&self) -> &str {
        "search_in_files"
    }

    fn description(&self) -> &str {
        "Search file contents with a regex. Returns `path:line:content` per match. Optional glob (e.g. *.ts) filters file names; maxResults caps matches."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression (falls back to literal text on syntax errors)"},
                "path": {"type": "string", "description": "Directory to search (default: workspace root)"},
                "glob": {"type": "string", "description": "File name filter, * and ? wildcards"},
                "maxResults": {"type": "number", "description": "Maximum matches (default 150, cap 500)"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<SearchParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if params.pattern.is_empty() {
            return ToolResult::error("Search pattern must not be empty");
        }

        // A bad regex is re-compiled as a literal search rather than failing.
        let regex = match Regex::new(&params.pattern) {
            Ok(r) => r,
            Err(_) => match Regex::new(&regex::escape(&params.pattern)) {
                Ok(r) => r,
                Err(e) => return ToolResult::error(format!("Unusable pattern: {e}")),
            },
        };

        let glob = match params.glob.as_deref().map(compile_glob).transpose() {
            Ok(g) => g,
            Err(e) => return ToolResult::error(format!("Invalid glob: {e}")),
        };

        let root = match ctx.resolve(params.path.as_deref().unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if !root.is_dir() {
            return ToolResult::error(format!(
                "Search path is not a directory: {}",
                params.path.as_deref().unwrap_or(".")
            ));
        }

        let max_results = params
            .max_results
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .min(MAX_RESULTS_CAP);

        let mut walker = Walker::new(regex, glob, max_results);
        walker.walk(&root, &ctx.working_dir);

        if walker.matches.is_empty() {
            return ToolResult::success("No matches found.");
        }

        let mut output = walker.matches.join("\n");
        if walker.truncated {
            output.push_str("\n[result limit reached]");
        }
        ToolResult::success(truncate_middle(&output, SEARCH_OUTPUT_CAP))
    }
}

/// Translate a shell-style glob into an anchored regex: `*` → `.*`, `?` → `.`.
fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

struct Walker {
    regex: Regex,
    glob: Option<Regex>,
    max_results: usize,
    files_visited: usize,
    matches: Vec<String>,
    truncated: bool,
}

impl Walker {
    fn new(regex: Regex, glob: Option<Regex>, max_results: usize) -> Self {
        Self {
            regex,
            glob,
            max_results,
            files_visited: 0,
            matches: Vec::new(),
            truncated: false,
        }
    }

    fn done(&self) -> bool {
        self.truncated || self.files_visited >= MAX_FILES_VISITED
    }

    fn walk(&mut self, dir: &Path, workspace_root: &Path) {
        let Ok(reader) = std::fs::read_dir(dir) else {
            return;
        };

        let mut files: Vec<PathBuf> = Vec::new();
        let mut dirs: Vec<PathBuf> = Vec::new();
        for entry in reader.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
        files.sort();
        dirs.sort();

        for file in files {
            if self.done() {
                return;
            }
            self.search_file(&file, workspace_root);
        }
        for sub in dirs {
            if self.done() {
                return;
            }
            self.walk(&sub, workspace_root);
        }
    }

    fn search_file(&mut self, file: &Path, workspace_root: &Path) {
        if let Some(glob) = &self.glob {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let relative = file
                .strip_prefix(workspace_root)
                .unwrap_or(file)
                .to_string_lossy()
                .to_string();
            let target = if glob.as_str().contains('/') {
                relative
            } else {
                name
            };
            if !glob.is_match(&target) {
                return;
            }
        }

        self.files_visited += 1;
        // Binary or unreadable files are silently skipped.
        let Ok(content) = std::fs::read_to_string(file) else {
            return;
        };

        let relative = file
            .strip_prefix(workspace_root)
            .unwrap_or(file)
            .to_string_lossy()
            .to_string();

        for (index, line) in content.lines().enumerate() {
            if self.regex.is_match(line) {
                self.matches
                    .push(format!("{relative}:{}:{}", index + 1, line.trim_end()));
                if self.matches.len() >= self.max_results {
                    self.truncated = true;
                    return;
                }
            }
        }
    }
}
