//! Role system prompts, embedded as opaque text assets.

use crate::roles::Role;

pub fn system_prompt(role: Role) -> &'static str {
    match role {
        Role::Analyzer => include_str!("../prompts/analyzer.md"),
        Role::Planner => include_str!("../prompts/planner.md"),
        Role::Executor => include_str!("../prompts/executor.md"),
        Role::Reviewer => include_str!("../prompts/reviewer.md"),
        Role::Coordinator => include_str!("../prompts/coordinator.md"),
        Role::Steward => include_str!("../prompts/steward.md"),
        Role::Oracle => include_str!("../prompts/oracle.md"),
    }
}
