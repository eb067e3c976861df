//! The closed set of agent roles and their per-role defaults.

use serde::{Deserialize, Serialize};

use crate::task::ArtifactType;

/// Every agent plays exactly one of these roles. The set is closed: new
/// behavior is added by changing role wiring, not by open inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Analyzer,
    Planner,
    Executor,
    Reviewer,
    Coordinator,
    Steward,
    Oracle,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Analyzer => "analyzer",
            Role::Planner => "planner",
            Role::Executor => "executor",
            Role::Reviewer => "reviewer",
            Role::Coordinator => "coordinator",
            Role::Steward => "steward",
            Role::Oracle => "oracle",
        }
    }

    /// Artifact type produced when this role completes.
    pub fn artifact_type(self) -> ArtifactType {
        match self {
            Role::Analyzer => ArtifactType::Analysis,
            Role::Planner => ArtifactType::Spec,
            Role::Executor => ArtifactType::CodeChanges,
            Role::Reviewer => ArtifactType::Review,
            Role::Coordinator => ArtifactType::Coordination,
            Role::Steward => ArtifactType::Management,
            Role::Oracle => ArtifactType::Oracle,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tested defaults for each role's model invocation.
#[derive(Debug, Clone, Copy)]
pub struct RoleDefaults {
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_turns: u32,
}

impl RoleDefaults {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Analyzer => Self {
                temperature: 0.3,
                max_tokens: 4096,
                max_turns: 5,
            },
            Role::Planner => Self {
                temperature: 0.5,
                max_tokens: 8192,
                max_turns: 8,
            },
            Role::Executor => Self {
                temperature: 0.2,
                max_tokens: 16384,
                max_turns: 20,
            },
            Role::Reviewer => Self {
                temperature: 0.1,
                max_tokens: 8192,
                max_turns: 8,
            },
            Role::Coordinator => Self {
                temperature: 0.4,
                max_tokens: 8192,
                max_turns: 10,
            },
            Role::Steward => Self {
                temperature: 0.2,
                max_tokens: 4096,
                max_turns: 3,
            },
            Role::Oracle => Self {
                temperature: 0.1,
                max_tokens: 2048,
                max_turns: 2,
            },
        }
    }
}

/// Fixed role → tool mapping. Steward and oracle reason in a single turn
/// and only get the completion tool.
pub fn tools_for_role(role: Role, cli_enabled: bool) -> Vec<&'static str> {
    match role {
        Role::Analyzer | Role::Planner => vec![
            "read_file",
            "read_files",
            "list_directory",
            "search_in_files",
            "run_terminal_command",
            "complete_task",
        ],
        Role::Executor => {
            let mut tools = vec![
                "read_file",
                "read_files",
                "write_file",
                "list_directory",
                "run_terminal_command",
                "git_operations",
            ];
            if cli_enabled {
                tools.push("invoke_cursor_cli");
            }
            tools.push("complete_task");
            tools
        }
        Role::Reviewer => vec![
            "review_workspace",
            "read_file",
            "read_files",
            "list_directory",
            "search_in_files",
            "run_terminal_command",
            "git_operations",
            "complete_task",
        ],
        Role::Coordinator => vec![
            "read_file",
            "read_files",
            "write_file",
            "list_directory",
            "run_terminal_command",
            "git_operations",
            "complete_task",
        ],
        Role::Steward | Role::Oracle => vec!["complete_task"],
    }
}
