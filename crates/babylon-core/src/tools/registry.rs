//! Name-keyed tool registry, assembled per role.

use std::sync::Arc;

use serde_json::Value;

use crate::ai::types::ToolSpec;
use crate::roles::{tools_for_role, Role};
use crate::tools::complete::CompleteTaskTool;
use crate::tools::fs::{ListDirectoryTool, ReadFileTool, ReadFilesTool, WriteFileTool};
use crate::tools::review::ReviewWorkspaceTool;
use crate::tools::search::SearchInFilesTool;
use crate::tools::shell::{GitOperationsTool, InvokeCursorCliTool, RunTerminalCommandTool};
use crate::tools::{Tool, ToolContext, ToolResult};

/// Ordered set of tools available to one agent.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Tool definitions handed to the provider for function calling.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect()
    }

    /// Execute a tool by name. `None` means the tool is unknown to this
    /// agent; the runtime reports that back to the model as an error.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> Option<ToolResult> {
        let tool = self.get(name)?;
        Some(tool.execute(params, ctx).await)
    }
}

fn tool_by_name(name: &str) -> Option<Arc<dyn Tool>> {
    let tool: Arc<dyn Tool> = match name {
        "read_file" => Arc::new(ReadFileTool),
        "read_files" => Arc::new(ReadFilesTool),
        "write_file" => Arc::new(WriteFileTool),
        "list_directory" => Arc::new(ListDirectoryTool),
        "search_in_files" => Arc::new(SearchInFilesTool),
        "run_terminal_command" => Arc::new(RunTerminalCommandTool),
        "git_operations" => Arc::new(GitOperationsTool),
        "review_workspace" => Arc::new(ReviewWorkspaceTool),
        "invoke_cursor_cli" => Arc::new(InvokeCursorCliTool),
        "complete_task" => Arc::new(CompleteTaskTool),
        _ => return None,
    };
    Some(tool)
}

/// Build the fixed tool set for a role.
pub fn registry_for_role(role: Role, cli_enabled: bool) -> ToolRegistry {
    let tools = tools_for_role(role, cli_enabled)
        .into_iter()
        .filter_map(tool_by_name)
        .collect();
    ToolRegistry::new(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_tool_returns_none() {
        let registry = registry_for_role(Role::Steward, false);
        let ctx = ToolContext::new(std::env::temp_dir());
        let result = registry.execute("read_file", json!({}), &ctx).await;
        assert!(result.is_none());
    }

    #[test]
    fn every_mapped_tool_resolves() {
        for role in [
            Role::Analyzer,
            Role::Planner,
            Role::Executor,
            Role::Reviewer,
            Role::Coordinator,
            Role::Steward,
            Role::Oracle,
        ] {
            let registry = registry_for_role(role, true);
            let names = tools_for_role(role, true);
            assert_eq!(registry.specs().len(), names.len(), "role {role}");
        }
    }

    #[test]
    fn specs_expose_schemas() {
        let registry = registry_for_role(Role::Executor, false);
        let specs = registry.specs();
        let write = specs.iter().find(|s| s.name == "write_file").unwrap();
        assert_eq!(write.input_schema["required"][0], "path");
    }
}
