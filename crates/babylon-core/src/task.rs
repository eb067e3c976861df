//! Task records, artifacts, token accounting and the org chart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::roles::Role;

/// Allocate a fresh task identity.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Review,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What kind of output an artifact carries (one per agent role).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Analysis,
    Spec,
    Decomposition,
    CodeChanges,
    Review,
    Coordination,
    Management,
    Oracle,
}

/// Structured result of one agent completion. Artifacts belong to the task
/// that produced them and are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub content: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(artifact_type: ArtifactType, content: impl Into<String>) -> Self {
        Self {
            artifact_type,
            content: content.into(),
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    /// Free-form notes the producing agent left for the next agent.
    pub fn handoff_notes(&self) -> Option<&str> {
        self.metadata.get("handoff_notes").and_then(Value::as_str)
    }

    /// Reviewer findings attached for the revision pass.
    pub fn review_notes(&self) -> Option<&str> {
        self.metadata.get("review_notes").and_then(Value::as_str)
    }
}

/// A unit of work flowing through the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_role: Option<Role>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub children: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            complexity: None,
            assigned_role: None,
            artifacts: Vec::new(),
            children: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Complexity is assigned at most once; later writes are ignored.
    pub fn set_complexity(&mut self, complexity: f64) {
        if self.complexity.is_none() {
            self.complexity = Some(complexity);
        }
    }

    pub fn push_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    /// The last artifact is the summary surfaced to the parent.
    pub fn last_artifact(&self) -> Option<&Artifact> {
        self.artifacts.last()
    }
}

/// Prompt/completion token counters. Purely additive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Node kind in the org chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgNodeType {
    Composite,
    Leaf,
}

/// One task in the org chart tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgNode {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub node_type: OrgNodeType,
    pub description: String,
    pub depth: u32,
    pub has_steward: bool,
}

/// Tree of tasks keyed by identity. Parent links are stored by id, never by
/// reference; adding a child mutates both the child node and the parent's
/// child list.
#[derive(Debug, Default)]
pub struct OrgChart {
    nodes: HashMap<String, OrgNode>,
    root: Option<String>,
}

impl OrgChart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_root(&mut self, task_id: &str, description: &str) {
        self.root = Some(task_id.to_string());
        self.nodes.insert(
            task_id.to_string(),
            OrgNode {
                task_id: task_id.to_string(),
                parent: None,
                children: Vec::new(),
                node_type: OrgNodeType::Leaf,
                description: description.to_string(),
                depth: 0,
                has_steward: false,
            },
        );
    }

    pub fn add_child(&mut self, parent_id: &str, task_id: &str, description: &str) {
        let depth = self
            .nodes
            .get(parent_id)
            .map(|n| n.depth + 1)
            .unwrap_or(1);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.push(task_id.to_string());
        }
        self.nodes.insert(
            task_id.to_string(),
            OrgNode {
                task_id: task_id.to_string(),
                parent: Some(parent_id.to_string()),
                children: Vec::new(),
                node_type: OrgNodeType::Leaf,
                description: description.to_string(),
                depth,
                has_steward: false,
            },
        );
    }

    /// Label a node as a composite with a steward attached.
    pub fn mark_composite(&mut self, task_id: &str, has_steward: bool) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.node_type = OrgNodeType::Composite;
            node.has_steward = has_steward;
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&OrgNode> {
        self.nodes.get(task_id)
    }

    pub fn root(&self) -> Option<&OrgNode> {
        self.root.as_deref().and_then(|id| self.nodes.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_is_write_once() {
        let mut task = Task::new("t1", "do a thing");
        task.set_complexity(0.3);
        task.set_complexity(0.9);
        assert_eq!(task.complexity, Some(0.3));
    }

    #[test]
    fn token_usage_is_additive() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        usage.add(TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.total_tokens, 18);
    }

    #[test]
    fn org_chart_links_parent_and_child() {
        let mut chart = OrgChart::new();
        chart.insert_root("root", "root task");
        chart.add_child("root", "c1", "first child");
        chart.mark_composite("root", true);

        let root = chart.get("root").unwrap();
        assert_eq!(root.children, vec!["c1".to_string()]);
        assert_eq!(root.node_type, OrgNodeType::Composite);
        assert!(root.has_steward);

        let child = chart.get("c1").unwrap();
        assert_eq!(child.parent.as_deref(), Some("root"));
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn artifact_metadata_notes() {
        let mut artifact = Artifact::new(ArtifactType::Review, "looks wrong");
        artifact.metadata.insert(
            "review_notes".to_string(),
            Value::String("missing validation".to_string()),
        );
        assert_eq!(artifact.review_notes(), Some("missing validation"));
        assert!(artifact.handoff_notes().is_none());
    }
}
