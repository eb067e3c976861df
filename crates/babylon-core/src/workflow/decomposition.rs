//! Decomposition execution and the composite QA cycle.
//!
//! Children run in parallel only when the plan asked for it and their file
//! scopes are disjoint; otherwise the run is downgraded to sequential.
//! After the children, a coordinator merges the work; failures route
//! through the steward (and, at the root, the oracle) for recovery.

use std::sync::Arc;

use futures::future::join_all;

use crate::agent::AgentStatus;
use crate::events::WorkflowEvent;
use crate::parsers::{
    self, OracleAction, PlannerOutput, StewardAction, SubtaskDef,
};
use crate::roles::Role;
use crate::task::{new_task_id, Artifact, TaskStatus};

use super::{clip, StepOverrides, TaskOutcome, TaskRunOptions, WorkflowEngine};

/// Everything `run_task` hands over when a plan decomposes.
pub(crate) struct DecompositionRun {
    pub task_id: String,
    pub description: String,
    pub depth: u32,
    pub subtasks: Vec<SubtaskDef>,
    pub parallel: bool,
    pub setup_task: Option<SubtaskDef>,
    pub acceptance_criteria: Vec<String>,
    pub artifacts_so_far: Vec<Artifact>,
}

/// One child task tracked across the composite lifecycle.
struct ChildRecord {
    def: SubtaskDef,
    task_id: String,
    status: TaskStatus,
    last_summary: String,
}

struct CoordinatorPass {
    status: AgentStatus,
    summary: String,
    review_notes: String,
}

/// Normalize a scope prefix: trim, drop trailing slashes, empty → `.`.
fn normalize_scope(scope: &str) -> String {
    let trimmed = scope.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

fn scopes_overlap(a: &[String], b: &[String]) -> bool {
    // An empty scope list means the whole tree.
    if a.is_empty() || b.is_empty() {
        return true;
    }
    for left in a.iter().map(|s| normalize_scope(s)) {
        for right in b.iter().map(|s| normalize_scope(s)) {
            if left == "." || right == "." {
                return true;
            }
            if left == right
                || left.starts_with(&format!("{right}/"))
                || right.starts_with(&format!("{left}/"))
            {
                return true;
            }
        }
    }
    false
}

/// Whether any pair of subtasks could touch the same files.
pub(crate) fn have_overlapping_file_scopes(subtasks: &[SubtaskDef]) -> bool {
    for (i, a) in subtasks.iter().enumerate() {
        for b in subtasks.iter().skip(i + 1) {
            if scopes_overlap(&a.file_scope, &b.file_scope) {
                return true;
            }
        }
    }
    false
}

/// A subtask duplicating the setup task (exactly, or sharing at least two
/// of its non-trivial words) is dropped before execution.
pub(crate) fn duplicates_setup(subtask: &str, setup: &str) -> bool {
    let subtask_norm = subtask.trim().to_lowercase();
    let setup_norm = setup.trim().to_lowercase();
    if subtask_norm == setup_norm {
        return true;
    }

    let subtask_words: std::collections::HashSet<&str> =
        subtask_norm.split_whitespace().collect();
    let shared = setup_norm
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .filter(|w| subtask_words.contains(w))
        .count();
    shared >= 2
}

fn agent_status_of(status: TaskStatus) -> AgentStatus {
    match status {
        TaskStatus::Completed => AgentStatus::Completed,
        TaskStatus::Failed => AgentStatus::Failed,
        _ => AgentStatus::NeedsReview,
    }
}

impl WorkflowEngine {
    pub(crate) async fn run_decomposition(
        self: &Arc<Self>,
        run: DecompositionRun,
    ) -> TaskOutcome {
        let mut artifacts = run.artifacts_so_far;

        // ── Duplicate-setup filter ─────────────────────────────────
        let mut subtasks = run.subtasks;
        if let Some(setup) = &run.setup_task {
            let before = subtasks.len();
            subtasks.retain(|s| !duplicates_setup(&s.description, &setup.description));
            if subtasks.len() < before {
                tracing::info!(
                    task_id = %run.task_id,
                    dropped = before - subtasks.len(),
                    "Dropped subtasks duplicating the setup task"
                );
            }
        }
        if subtasks.is_empty() {
            tracing::warn!(task_id = %run.task_id, "Decomposition left no subtasks");
            return TaskOutcome::failed(artifacts);
        }

        // ── Parallel vs sequential ─────────────────────────────────
        let mut parallel = run.parallel;
        if parallel && have_overlapping_file_scopes(&subtasks) {
            tracing::warn!(
                task_id = %run.task_id,
                "Overlapping file scopes: downgrading parallel decomposition to sequential"
            );
            parallel = false;
        }

        if run.depth == 0 {
            self.org
                .lock()
                .expect("org chart poisoned")
                .mark_composite(&run.task_id, true);
        }

        // ── Setup first ────────────────────────────────────────────
        if let Some(setup) = &run.setup_task {
            let setup_id = new_task_id();
            self.create_task(&setup_id, &setup.description, Some(&run.task_id));
            let outcome = self
                .run_task(TaskRunOptions {
                    task_id: setup_id,
                    description: setup.description.clone(),
                    depth: run.depth + 1,
                    file_scope: scope_of(setup),
                    skip_analysis: setup.skip_analysis,
                    parent_context: Some(format!("Parent task: {}", run.description)),
                })
                .await;
            if let Some(artifact) = outcome.artifacts.last() {
                artifacts.push(artifact.clone());
            }
            if outcome.status == TaskStatus::Failed {
                tracing::warn!(task_id = %run.task_id, "Setup task failed");
                return TaskOutcome::failed(artifacts);
            }
        }

        // ── Run children ───────────────────────────────────────────
        let mut children: Vec<ChildRecord> = subtasks
            .into_iter()
            .map(|def| {
                let child_id = new_task_id();
                self.create_task(&child_id, &def.description, Some(&run.task_id));
                ChildRecord {
                    task_id: child_id,
                    status: TaskStatus::Pending,
                    last_summary: String::new(),
                    def,
                }
            })
            .collect();

        let all_ok = self
            .run_children(
                &run.task_id,
                &run.description,
                run.depth,
                parallel,
                &mut children,
                &mut artifacts,
            )
            .await;
        if !all_ok {
            return TaskOutcome::failed(artifacts);
        }

        // ── Composite QA cycle ─────────────────────────────────────
        let mut pass = self
            .run_coordinator(&run.task_id, &run.description, &children, &run.acceptance_criteria, None, &mut artifacts)
            .await;
        if pass.status == AgentStatus::Completed {
            return TaskOutcome {
                status: TaskStatus::Completed,
                artifacts,
            };
        }

        for cycle in 1..=self.options.max_composite_cycles {
            self.bus.publish(WorkflowEvent::CompositeCycleStart {
                task_id: run.task_id.clone(),
                cycle,
                max_cycles: self.options.max_composite_cycles,
            });

            let action = self
                .steward_decision_with_oracle(
                    &run.task_id,
                    &run.description,
                    &children,
                    &pass,
                    run.depth,
                )
                .await;

            match action {
                StewardAction::Escalate => {
                    return TaskOutcome {
                        status: TaskStatus::Review,
                        artifacts,
                    };
                }
                StewardAction::RetryMerge => {}
                StewardAction::RetryChildren { indices, focus } => {
                    for index in indices {
                        let Some(child) = children.get_mut(index) else {
                            tracing::warn!(index, "retry_children index out of range, ignoring");
                            continue;
                        };
                        let mut context = format!("Parent task: {}", run.description);
                        if let Some(focus) = &focus {
                            context = format!("Steward voice: {focus}\n\n{context}");
                        }
                        self.rerun_child(&run.task_id, child, index, context, run.depth, &mut artifacts)
                            .await;
                    }
                }
                StewardAction::AddFixTask { description } => {
                    let fix_description = description
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| {
                            if pass.review_notes.is_empty() {
                                "Fix the issues found during verification".to_string()
                            } else {
                                pass.review_notes.clone()
                            }
                        });
                    let child_id = new_task_id();
                    self.create_task(&child_id, &fix_description, Some(&run.task_id));
                    let mut child = ChildRecord {
                        def: SubtaskDef {
                            description: fix_description,
                            file_scope: Vec::new(),
                            skip_analysis: true,
                        },
                        task_id: child_id,
                        status: TaskStatus::Pending,
                        last_summary: String::new(),
                    };
                    let index = children.len();
                    let context = format!("Parent task: {}", run.description);
                    self.rerun_child(&run.task_id, &mut child, index, context, run.depth, &mut artifacts)
                        .await;
                    children.push(child);
                }
                StewardAction::ReDecompose => {
                    let replan_context = format!(
                        "Re-decompose this task: {}\n\nThe previous decomposition was merged \
                         but failed verification:\n{}",
                        run.description,
                        clip(&pass.review_notes, 500)
                    );
                    let replan = self
                        .run_step(
                            Role::Planner,
                            &run.task_id,
                            &replan_context,
                            None,
                            StepOverrides::default(),
                        )
                        .await;
                    artifacts.push(replan.result.artifact.clone());

                    if let PlannerOutput::Decomposition {
                        subtasks: new_subtasks,
                        parallel: new_parallel,
                        setup_task: new_setup,
                        ..
                    } = parsers::parse_planner(&replan.result.artifact.content)
                    {
                        let mut new_subtasks = new_subtasks;
                        if let Some(setup) = &new_setup {
                            new_subtasks
                                .retain(|s| !duplicates_setup(&s.description, &setup.description));
                        }
                        if new_subtasks.is_empty() {
                            tracing::warn!("Re-decomposition produced no subtasks, continuing");
                            continue;
                        }

                        let run_parallel =
                            new_parallel && !have_overlapping_file_scopes(&new_subtasks);
                        if new_parallel && !run_parallel {
                            tracing::warn!(
                                "Overlapping file scopes in re-decomposition: running sequentially"
                            );
                        }

                        children = new_subtasks
                            .into_iter()
                            .map(|def| {
                                let child_id = new_task_id();
                                self.create_task(&child_id, &def.description, Some(&run.task_id));
                                ChildRecord {
                                    task_id: child_id,
                                    status: TaskStatus::Pending,
                                    last_summary: String::new(),
                                    def,
                                }
                            })
                            .collect();
                        let all_ok = self
                            .run_children(
                                &run.task_id,
                                &run.description,
                                run.depth,
                                run_parallel,
                                &mut children,
                                &mut artifacts,
                            )
                            .await;
                        if !all_ok {
                            return TaskOutcome::failed(artifacts);
                        }
                    } else {
                        tracing::info!("Re-decomposition yielded a spec, skipping to next cycle");
                        continue;
                    }
                }
            }

            pass = self
                .run_coordinator(
                    &run.task_id,
                    &run.description,
                    &children,
                    &run.acceptance_criteria,
                    Some(pass.review_notes.as_str()),
                    &mut artifacts,
                )
                .await;
            if pass.status == AgentStatus::Completed {
                return TaskOutcome {
                    status: TaskStatus::Completed,
                    artifacts,
                };
            }
        }

        // ── Root-only final oracle pass ────────────────────────────
        if run.depth == 0 {
            let oracle_action = self
                .consult_oracle(
                    &run.task_id,
                    &run.description,
                    "composite cycles exhausted without a clean merge",
                    &pass.review_notes,
                    &children,
                )
                .await;

            let retry_merge = match oracle_action {
                Some(OracleAction::NudgeRootSteward { message }) => {
                    let action = self
                        .steward_decision(
                            &run.task_id,
                            &run.description,
                            &children,
                            &pass,
                            Some(message),
                        )
                        .await;
                    action == StewardAction::RetryMerge
                }
                Some(OracleAction::RetryOnce { .. }) => true,
                _ => false,
            };

            if retry_merge {
                pass = self
                    .run_coordinator(
                        &run.task_id,
                        &run.description,
                        &children,
                        &run.acceptance_criteria,
                        Some(pass.review_notes.as_str()),
                        &mut artifacts,
                    )
                    .await;
                if pass.status == AgentStatus::Completed {
                    return TaskOutcome {
                        status: TaskStatus::Completed,
                        artifacts,
                    };
                }
            }
        }

        TaskOutcome {
            status: if pass.status == AgentStatus::NeedsReview {
                TaskStatus::Review
            } else {
                TaskStatus::Failed
            },
            artifacts,
        }
    }

    /// Run all children, parallel or sequential. Returns false if the
    /// aggregate failed.
    async fn run_children(
        self: &Arc<Self>,
        parent_id: &str,
        description: &str,
        depth: u32,
        parallel: bool,
        children: &mut [ChildRecord],
        artifacts: &mut Vec<Artifact>,
    ) -> bool {
        if parallel {
            for (index, child) in children.iter().enumerate() {
                self.bus.publish(WorkflowEvent::SubtaskStart {
                    task_id: child.task_id.clone(),
                    parent_id: parent_id.to_string(),
                    index,
                    description: child.def.description.clone(),
                });
            }

            let handles: Vec<_> = children
                .iter()
                .map(|child| {
                    tokio::spawn(self.run_task(TaskRunOptions {
                        task_id: child.task_id.clone(),
                        description: child.def.description.clone(),
                        depth: depth + 1,
                        file_scope: scope_of(&child.def),
                        skip_analysis: child.def.skip_analysis,
                        parent_context: Some(format!("Parent task: {description}")),
                    }))
                })
                .collect();

            let outcomes = join_all(handles).await;
            let mut all_ok = true;
            for (index, joined) in outcomes.into_iter().enumerate() {
                let child = &mut children[index];
                match joined {
                    Ok(outcome) => {
                        child.status = outcome.status;
                        child.last_summary = outcome
                            .artifacts
                            .last()
                            .map(|a| clip(&a.content, 200))
                            .unwrap_or_default();
                        if let Some(artifact) = outcome.artifacts.last() {
                            artifacts.push(artifact.clone());
                        }
                    }
                    Err(e) => {
                        tracing::error!(index, "Subtask task panicked: {e}");
                        child.status = TaskStatus::Failed;
                    }
                }
                if child.status == TaskStatus::Failed {
                    all_ok = false;
                }
                self.bus.publish(WorkflowEvent::SubtaskComplete {
                    task_id: child.task_id.clone(),
                    parent_id: parent_id.to_string(),
                    index,
                    status: child.status,
                });
            }
            all_ok
        } else {
            for index in 0..children.len() {
                // Oversight check-ins happen only on the sequential path.
                let nudge = self.maybe_oversight_check_in(parent_id).await;
                let mut context = format!("Parent task: {description}");
                if let Some(nudge) = &nudge {
                    context = format!("Steward voice: {nudge}\n\n{context}");
                }

                let child = &mut children[index];
                let status = self
                    .rerun_child(parent_id, child, index, context, depth, artifacts)
                    .await;

                if let Some(nudge) = nudge {
                    self.oversight
                        .record_nudge_outcome(nudge, agent_status_of(status));
                }
                if status == TaskStatus::Failed {
                    return false;
                }
            }
            true
        }
    }

    /// Run (or re-run) a single child sequentially, emitting the subtask
    /// event pair.
    async fn rerun_child(
        self: &Arc<Self>,
        parent_id: &str,
        child: &mut ChildRecord,
        index: usize,
        parent_context: String,
        depth: u32,
        artifacts: &mut Vec<Artifact>,
    ) -> TaskStatus {
        self.bus.publish(WorkflowEvent::SubtaskStart {
            task_id: child.task_id.clone(),
            parent_id: parent_id.to_string(),
            index,
            description: child.def.description.clone(),
        });

        let outcome = self
            .run_task(TaskRunOptions {
                task_id: child.task_id.clone(),
                description: child.def.description.clone(),
                depth: depth + 1,
                file_scope: scope_of(&child.def),
                skip_analysis: child.def.skip_analysis,
                parent_context: Some(parent_context),
            })
            .await;

        child.status = outcome.status;
        child.last_summary = outcome
            .artifacts
            .last()
            .map(|a| clip(&a.content, 200))
            .unwrap_or_default();
        if let Some(artifact) = outcome.artifacts.last() {
            artifacts.push(artifact.clone());
        }

        self.bus.publish(WorkflowEvent::SubtaskComplete {
            task_id: child.task_id.clone(),
            parent_id: parent_id.to_string(),
            index,
            status: outcome.status,
        });
        outcome.status
    }

    async fn run_coordinator(
        self: &Arc<Self>,
        task_id: &str,
        description: &str,
        children: &[ChildRecord],
        acceptance_criteria: &[String],
        prior_review_notes: Option<&str>,
        artifacts: &mut Vec<Artifact>,
    ) -> CoordinatorPass {
        let mut context = format!("Original task: {description}\n\nCompleted subtasks:\n");
        for (index, child) in children.iter().enumerate() {
            context.push_str(&format!("Subtask {index}: {}\n", child.last_summary));
        }
        context.push_str(
            "\nMerge the subtask results into a coherent whole and run the full test suite.",
        );
        if !acceptance_criteria.is_empty() {
            context.push_str("\n\nComposite acceptance criteria:\n");
            for criterion in acceptance_criteria {
                context.push_str(&format!("- {criterion}\n"));
            }
        }
        if let Some(notes) = prior_review_notes.filter(|n| !n.is_empty()) {
            context.push_str(&format!(
                "\n\nA previous verification found issues:\n{notes}"
            ));
        }

        let pass = self
            .run_step(Role::Coordinator, task_id, &context, None, StepOverrides::default())
            .await;
        artifacts.push(pass.result.artifact.clone());

        CoordinatorPass {
            status: pass.result.status,
            summary: pass
                .result
                .artifact
                .metadata
                .get("summary")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&pass.result.artifact.content)
                .to_string(),
            review_notes: pass
                .result
                .artifact
                .review_notes()
                .map(ToString::to_string)
                .unwrap_or_else(|| pass.result.artifact.content.clone()),
        }
    }

    /// One steward consultation, with the root-only oracle escalation path.
    async fn steward_decision_with_oracle(
        self: &Arc<Self>,
        task_id: &str,
        description: &str,
        children: &[ChildRecord],
        pass: &CoordinatorPass,
        depth: u32,
    ) -> StewardAction {
        let mut action = self
            .steward_decision(task_id, description, children, pass, None)
            .await;

        if action == StewardAction::Escalate && depth == 0 {
            match self
                .consult_oracle(
                    task_id,
                    description,
                    "root steward chose to escalate",
                    &pass.review_notes,
                    children,
                )
                .await
            {
                Some(OracleAction::NudgeRootSteward { message }) => {
                    action = self
                        .steward_decision(task_id, description, children, pass, Some(message))
                        .await;
                }
                Some(OracleAction::RetryOnce { .. }) => {
                    action = StewardAction::RetryMerge;
                }
                Some(OracleAction::EscalateToUser) | None => {}
            }
        }
        action
    }

    async fn steward_decision(
        self: &Arc<Self>,
        task_id: &str,
        description: &str,
        children: &[ChildRecord],
        pass: &CoordinatorPass,
        oracle_nudge: Option<String>,
    ) -> StewardAction {
        let mut context = String::new();
        if let Some(nudge) = oracle_nudge {
            context.push_str(&format!("The Oracle says: {nudge}\n\n"));
        }
        context.push_str(&format!("Original task: {description}\n\nSubtasks:\n"));
        for (index, child) in children.iter().enumerate() {
            context.push_str(&format!(
                "{index}. [{}] {}\n",
                child.status,
                clip(&child.last_summary, 150)
            ));
        }
        context.push_str(&format!(
            "\nMerge/QA result ({}): {}\n\nReview notes:\n{}\n\nDecide the next action and call \
             complete_task with content = JSON: {{action, ...}}.",
            pass.status,
            clip(&pass.summary, 300),
            pass.review_notes
        ));

        let decision = self
            .run_step(Role::Steward, task_id, &context, None, StepOverrides::default())
            .await;

        parsers::parse_steward(&decision.result.artifact.content)
            .unwrap_or(StewardAction::Escalate)
    }

    async fn consult_oracle(
        self: &Arc<Self>,
        task_id: &str,
        description: &str,
        situation: &str,
        review_notes: &str,
        children: &[ChildRecord],
    ) -> Option<OracleAction> {
        let mut snapshot = format!(
            "Root task: {}\nRoot steward situation: {situation}\nReview notes: {}\nChildren:\n",
            clip(description, 200),
            clip(review_notes, 500)
        );
        for (index, child) in children.iter().enumerate() {
            snapshot.push_str(&format!(
                "{index}. [{}] {}\n",
                child.status,
                clip(&child.last_summary, 80)
            ));
        }

        self.bus.publish(WorkflowEvent::OracleInvoked {
            snapshot_summary: clip(&snapshot, 200),
        });

        let consultation = self
            .run_step(Role::Oracle, task_id, &snapshot, None, StepOverrides::default())
            .await;

        let action = parsers::parse_oracle(&consultation.result.artifact.content);
        self.bus.publish(WorkflowEvent::OracleDecision {
            action: match &action {
                Some(OracleAction::NudgeRootSteward { .. }) => "nudge_root_steward".to_string(),
                Some(OracleAction::RetryOnce { .. }) => "retry_once".to_string(),
                Some(OracleAction::EscalateToUser) => "escalate_to_user".to_string(),
                None => "unparseable".to_string(),
            },
        });
        action
    }
}

fn scope_of(def: &SubtaskDef) -> Option<Vec<String>> {
    if def.file_scope.is_empty() {
        None
    } else {
        Some(def.file_scope.clone())
    }
}
