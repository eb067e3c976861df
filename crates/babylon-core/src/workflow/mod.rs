//! The workflow engine: recursive task routing.
//!
//! A task enters `run_task` and is routed by complexity: trivial tasks go
//! straight to the execute-review cycle, medium tasks get a planner spec,
//! complex tasks decompose into subtasks (see `decomposition`). One shared
//! cancellation handle and one event bus thread through everything.

mod decomposition;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};

use crate::agent::{AgentConfig, AgentResult, AgentRuntime, AgentStatus};
use crate::ai::Provider;
use crate::cancellation::CancellationHandle;
use crate::events::{EventBus, WorkflowEvent};
use crate::oversight::OversightTracker;
use crate::parsers::{self, PlannerOutput};
use crate::persistence::TaskStore;
use crate::prompts;
use crate::roles::{Role, RoleDefaults};
use crate::task::{new_task_id, Artifact, OrgChart, Task, TaskStatus};
use crate::tools::{registry_for_role, ToolContext};

/// Engine-level knobs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub max_depth: u32,
    pub max_retries: u32,
    pub max_composite_cycles: u32,
    pub complexity_direct_threshold: f64,
    pub economy_mode: bool,
    pub cli_enabled: bool,
    pub max_context_turns: Option<usize>,
    pub simple_path_max_turns: Option<u32>,
    pub oversight_probability: f64,
    pub max_oversight_per_composite: u32,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_retries: 2,
            max_composite_cycles: 2,
            complexity_direct_threshold: 0.35,
            economy_mode: false,
            cli_enabled: true,
            max_context_turns: None,
            simple_path_max_turns: None,
            oversight_probability: 0.25,
            max_oversight_per_composite: 2,
        }
    }
}

/// Which provider and models the engine uses per role.
#[derive(Clone)]
pub struct ModelSelection {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub reviewer_model: Option<String>,
    /// Cheaper model forced onto the reviewer in economy cycles.
    pub economy_model: Option<String>,
}

impl ModelSelection {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            reviewer_model: None,
            economy_model: None,
        }
    }

    fn model_for(&self, role: Role) -> String {
        match role {
            Role::Reviewer => self
                .reviewer_model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            _ => self.model.clone(),
        }
    }

    fn economy_reviewer_model(&self) -> String {
        self.economy_model
            .clone()
            .or_else(|| self.reviewer_model.clone())
            .unwrap_or_else(|| self.model.clone())
    }
}

/// What one task run produced.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub artifacts: Vec<Artifact>,
}

impl TaskOutcome {
    pub fn failed(artifacts: Vec<Artifact>) -> Self {
        Self {
            status: TaskStatus::Failed,
            artifacts,
        }
    }
}

/// Result of the whole workflow.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

/// Options for one `run_task` invocation.
#[derive(Debug, Clone)]
pub struct TaskRunOptions {
    pub task_id: String,
    pub description: String,
    pub depth: u32,
    pub file_scope: Option<Vec<String>>,
    pub skip_analysis: bool,
    pub parent_context: Option<String>,
}

impl TaskRunOptions {
    pub fn root(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            depth: 0,
            file_scope: None,
            skip_analysis: false,
            parent_context: None,
        }
    }
}

/// Settings for one execute-review cycle.
struct CycleOptions {
    executor_max_turns: u32,
    executor_context_prefix: Option<&'static str>,
    reviewer_max_turns: u32,
    reviewer_model: Option<String>,
}

const ECONOMY_PREFIX: &str = "This is a small task. Make the minimal change. Prefer read_file \
and write_file; avoid invoke_cursor_cli unless necessary. Use as few turns as possible.";

impl CycleOptions {
    fn standard(options: &WorkflowOptions, models: &ModelSelection) -> Self {
        Self {
            executor_max_turns: RoleDefaults::for_role(Role::Executor).max_turns,
            executor_context_prefix: None,
            reviewer_max_turns: RoleDefaults::for_role(Role::Reviewer).max_turns,
            // Global economy mode also downgrades the reviewer model.
            reviewer_model: options
                .economy_mode
                .then(|| models.economy_reviewer_model()),
        }
    }

    fn economy(options: &WorkflowOptions, models: &ModelSelection) -> Self {
        Self {
            executor_max_turns: options.simple_path_max_turns.unwrap_or(8),
            executor_context_prefix: Some(ECONOMY_PREFIX),
            reviewer_max_turns: 5,
            reviewer_model: Some(models.economy_reviewer_model()),
        }
    }
}

pub(crate) struct StepRun {
    pub step_id: String,
    pub result: AgentResult,
}

#[derive(Default)]
pub(crate) struct StepOverrides {
    pub max_turns: Option<u32>,
    pub model: Option<String>,
}

pub struct WorkflowEngine {
    pub(crate) models: ModelSelection,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) cancellation: CancellationHandle,
    pub(crate) oversight: Arc<OversightTracker>,
    pub(crate) store: Option<Arc<TaskStore>>,
    pub(crate) working_dir: PathBuf,
    pub(crate) options: WorkflowOptions,
    pub(crate) org: Mutex<OrgChart>,
    tasks: Mutex<HashMap<String, Task>>,
    oversight_budget: Mutex<HashMap<String, u32>>,
}

impl WorkflowEngine {
    pub fn new(
        models: ModelSelection,
        bus: Arc<EventBus>,
        cancellation: CancellationHandle,
        oversight: Arc<OversightTracker>,
        store: Option<Arc<TaskStore>>,
        working_dir: PathBuf,
        options: WorkflowOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            models,
            bus,
            cancellation,
            oversight,
            store,
            working_dir,
            options,
            org: Mutex::new(OrgChart::new()),
            tasks: Mutex::new(HashMap::new()),
            oversight_budget: Mutex::new(HashMap::new()),
        })
    }

    /// Run one root task to completion.
    pub async fn run(self: &Arc<Self>, description: &str, root_task_id: &str) -> WorkflowReport {
        let started = Instant::now();
        self.bus.publish(WorkflowEvent::WorkflowStart {
            task_id: root_task_id.to_string(),
            description: description.to_string(),
        });

        self.create_task(root_task_id, description, None);
        self.org
            .lock()
            .expect("org chart poisoned")
            .insert_root(root_task_id, description);

        let outcome = self
            .run_task(TaskRunOptions::root(root_task_id, description))
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        self.bus.publish(WorkflowEvent::WorkflowComplete {
            task_id: root_task_id.to_string(),
            status: outcome.status,
            duration_ms,
        });

        WorkflowReport {
            task_id: root_task_id.to_string(),
            status: outcome.status,
            artifacts: outcome.artifacts,
            duration_ms,
        }
    }

    /// Recursive entry point for one task. Boxed so decomposition can
    /// re-enter it for children.
    pub fn run_task(self: &Arc<Self>, opts: TaskRunOptions) -> BoxFuture<'static, TaskOutcome> {
        let engine = Arc::clone(self);
        async move { engine.run_task_inner(opts).await }.boxed()
    }

    async fn run_task_inner(self: Arc<Self>, opts: TaskRunOptions) -> TaskOutcome {
        self.set_task_status(&opts.task_id, TaskStatus::InProgress);

        if opts.skip_analysis {
            // Straight to implementation; assume medium complexity.
            let context = compose_context(opts.parent_context.as_deref(), &opts.description);
            let outcome = self
                .execute_review_cycle(
                    &opts.task_id,
                    &opts.description,
                    &context,
                    opts.file_scope.clone(),
                    CycleOptions::standard(&self.options, &self.models),
                )
                .await;
            self.set_task_status(&opts.task_id, outcome.status);
            return outcome;
        }

        let mut artifacts: Vec<Artifact> = Vec::new();

        // ── Analyze ────────────────────────────────────────────────
        let analyzer_context = compose_context(
            opts.parent_context.as_deref(),
            &format!("Task: {}", opts.description),
        );
        let analysis = self
            .run_step(
                Role::Analyzer,
                &opts.task_id,
                &analyzer_context,
                None,
                StepOverrides::default(),
            )
            .await;
        artifacts.push(analysis.result.artifact.clone());
        if analysis.result.status == AgentStatus::Failed {
            self.set_task_status(&opts.task_id, TaskStatus::Failed);
            return TaskOutcome::failed(artifacts);
        }

        let analyzed = parsers::parse_analyzer(&analysis.result.artifact.content);
        self.set_task_complexity(&opts.task_id, analyzed.complexity);

        // ── Direct path ────────────────────────────────────────────
        if analyzed.complexity <= self.options.complexity_direct_threshold {
            tracing::info!(
                task_id = %opts.task_id,
                complexity = analyzed.complexity,
                "Low complexity, skipping planner"
            );
            let context = compose_context(
                opts.parent_context.as_deref(),
                &format!(
                    "Task: {}\n\nAnalysis: {}\nRecommended approach: {}",
                    opts.description, analyzed.summary, analyzed.recommended_approach
                ),
            );
            let mut outcome = self
                .execute_review_cycle(
                    &opts.task_id,
                    &opts.description,
                    &context,
                    opts.file_scope.clone(),
                    CycleOptions::economy(&self.options, &self.models),
                )
                .await;
            outcome.artifacts = splice(artifacts, std::mem::take(&mut outcome.artifacts));
            self.set_task_status(&opts.task_id, outcome.status);
            return outcome;
        }

        // ── Plan ───────────────────────────────────────────────────
        let planner_context = compose_context(
            opts.parent_context.as_deref(),
            &format!(
                "Task: {}\n\nAnalyzer findings:\n{}",
                opts.description, analysis.result.artifact.content
            ),
        );
        let planning = self
            .run_step(
                Role::Planner,
                &opts.task_id,
                &planner_context,
                None,
                StepOverrides::default(),
            )
            .await;
        artifacts.push(planning.result.artifact.clone());
        if planning.result.status == AgentStatus::Failed {
            self.set_task_status(&opts.task_id, TaskStatus::Failed);
            return TaskOutcome::failed(artifacts);
        }

        match parsers::parse_planner(&planning.result.artifact.content) {
            PlannerOutput::Spec {
                spec, file_scope, acceptance_criteria, ..
            } => {
                let mut context = format!("Task: {}\n\nSpec:\n{spec}", opts.description);
                if !acceptance_criteria.is_empty() {
                    context.push_str("\n\nAcceptance criteria:\n");
                    for criterion in &acceptance_criteria {
                        context.push_str(&format!("- {criterion}\n"));
                    }
                }
                let scope = if file_scope.is_empty() {
                    opts.file_scope.clone()
                } else {
                    Some(file_scope)
                };
                let mut outcome = self
                    .execute_review_cycle(
                        &opts.task_id,
                        &opts.description,
                        &compose_context(opts.parent_context.as_deref(), &context),
                        scope,
                        CycleOptions::standard(&self.options, &self.models),
                    )
                    .await;
                outcome.artifacts = splice(artifacts, std::mem::take(&mut outcome.artifacts));
                self.set_task_status(&opts.task_id, outcome.status);
                outcome
            }
            PlannerOutput::Decomposition {
                subtasks,
                parallel,
                setup_task,
                acceptance_criteria,
            } => {
                if opts.depth >= self.options.max_depth {
                    // Recursion bound: force spec mode.
                    tracing::warn!(
                        task_id = %opts.task_id,
                        depth = opts.depth,
                        "Max depth reached, forcing single-unit implementation"
                    );
                    let context = format!(
                        "Task: {}\n\nMax decomposition depth reached; implement this as a \
                         single unit of work.\n\nPlanner output for reference:\n{}",
                        opts.description, planning.result.artifact.content
                    );
                    let mut outcome = self
                        .execute_review_cycle(
                            &opts.task_id,
                            &opts.description,
                            &compose_context(opts.parent_context.as_deref(), &context),
                            opts.file_scope.clone(),
                            CycleOptions::standard(&self.options, &self.models),
                        )
                        .await;
                    outcome.artifacts = splice(artifacts, std::mem::take(&mut outcome.artifacts));
                    self.set_task_status(&opts.task_id, outcome.status);
                    return outcome;
                }

                let outcome = self
                    .run_decomposition(decomposition::DecompositionRun {
                        task_id: opts.task_id.clone(),
                        description: opts.description.clone(),
                        depth: opts.depth,
                        subtasks,
                        parallel,
                        setup_task,
                        acceptance_criteria,
                        artifacts_so_far: artifacts,
                    })
                    .await;
                self.set_task_status(&opts.task_id, outcome.status);
                outcome
            }
        }
    }

    // ── Execute-review cycle (the backslip loop) ───────────────────

    async fn execute_review_cycle(
        &self,
        task_id: &str,
        description: &str,
        spec_context: &str,
        file_scope: Option<Vec<String>>,
        cycle: CycleOptions,
    ) -> TaskOutcome {
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut executor_context = match cycle.executor_context_prefix {
            Some(prefix) => format!("{prefix}\n\n{spec_context}"),
            None => spec_context.to_string(),
        };

        for attempt in 0..=self.options.max_retries {
            if self.cancellation.is_cancelled() {
                return TaskOutcome::failed(artifacts);
            }

            let execution = self
                .run_step(
                    Role::Executor,
                    task_id,
                    &executor_context,
                    file_scope.clone(),
                    StepOverrides {
                        max_turns: Some(cycle.executor_max_turns),
                        model: None,
                    },
                )
                .await;
            artifacts.push(execution.result.artifact.clone());

            let executor_summary = execution
                .result
                .artifact
                .metadata
                .get("summary")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&execution.result.artifact.content)
                .to_string();

            let mut reviewer_context = format!(
                "Original task: {description}\n\nSpec/context given to the implementer:\n\
                 {spec_context}\n\nImplementer result ({}):\n{}",
                execution.result.status,
                clip(&executor_summary, 500)
            );
            if let Some(notes) = execution.result.artifact.handoff_notes() {
                reviewer_context.push_str(&format!("\n\nImplementer handoff notes:\n{notes}"));
            }

            let review = self
                .run_step(
                    Role::Reviewer,
                    task_id,
                    &reviewer_context,
                    file_scope.clone(),
                    StepOverrides {
                        max_turns: Some(cycle.reviewer_max_turns),
                        model: cycle.reviewer_model.clone(),
                    },
                )
                .await;
            artifacts.push(review.result.artifact.clone());

            if review.result.status == AgentStatus::Completed {
                return TaskOutcome {
                    status: TaskStatus::Completed,
                    artifacts,
                };
            }

            let review_notes = review
                .result
                .artifact
                .review_notes()
                .map(ToString::to_string)
                .unwrap_or_else(|| review.result.artifact.content.clone());

            if attempt < self.options.max_retries {
                self.bus.publish(WorkflowEvent::StepRetry {
                    step_id: review.step_id.clone(),
                    attempt,
                    max_retries: self.options.max_retries,
                    reason: clip(&review_notes, 300),
                });

                let nudge = self.maybe_oversight_check_in(task_id).await;

                executor_context = format!(
                    "{spec_context}\n--- REVISION REQUIRED ---\nThe Mirror (reviewer) found \
                     issues with your previous implementation:\n{review_notes}\nFix ONLY the \
                     issues described above. Do not change anything else."
                );
                if let Some(nudge) = nudge {
                    executor_context.push_str(&format!("\n\nSteward voice: {nudge}"));
                }
            }
        }

        TaskOutcome::failed(artifacts)
    }

    // ── Step runner ────────────────────────────────────────────────

    pub(crate) async fn run_step(
        &self,
        role: Role,
        task_id: &str,
        context: &str,
        file_scope: Option<Vec<String>>,
        overrides: StepOverrides,
    ) -> StepRun {
        let step_id = new_task_id();
        let defaults = RoleDefaults::for_role(role);
        let model = overrides.model.unwrap_or_else(|| self.models.model_for(role));

        self.bus.publish(WorkflowEvent::StepStart {
            step_id: step_id.clone(),
            task_id: task_id.to_string(),
            role,
        });

        let config = AgentConfig {
            role,
            system_prompt: prompts::system_prompt(role).to_string(),
            model: model.clone(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            max_turns: overrides.max_turns.unwrap_or(defaults.max_turns),
            max_context_turns: self.options.max_context_turns,
        };

        let runtime = AgentRuntime::new(
            Arc::clone(&self.models.provider),
            registry_for_role(role, self.options.cli_enabled),
            config,
            Arc::clone(&self.bus),
            self.cancellation.clone(),
        );

        let mut tool_ctx = ToolContext::new(self.working_dir.clone());
        tool_ctx.task_id = task_id.to_string();
        tool_ctx.file_scope = file_scope;
        tool_ctx.cancellation = self.cancellation.clone();

        let started = Instant::now();
        let result = runtime.run(&step_id, context, &tool_ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.bus.publish(WorkflowEvent::StepComplete {
            step_id: step_id.clone(),
            task_id: task_id.to_string(),
            role,
            status: result.status,
            usage: result.usage,
            duration_ms,
            model,
        });

        self.record_artifact(task_id, result.artifact.clone());
        StepRun { step_id, result }
    }

    // ── Oversight ──────────────────────────────────────────────────

    /// Possibly run a lightweight steward check-in. Returns a nudge to
    /// prepend to the next child's context.
    pub(crate) async fn maybe_oversight_check_in(&self, task_id: &str) -> Option<String> {
        if self.cancellation.is_cancelled() || !self.oversight.has_signals() {
            return None;
        }

        {
            let mut budget = self.oversight_budget.lock().expect("budget poisoned");
            let used = budget.entry(task_id.to_string()).or_insert(0);
            if *used >= self.options.max_oversight_per_composite {
                return None;
            }
            if rand::random::<f64>() >= self.options.oversight_probability {
                return None;
            }
            *used += 1;
        }

        let signals = self.oversight.take_signals();
        let described: Vec<String> = signals.iter().map(|s| s.describe()).collect();

        let mut context = String::from(
            "Mid-workflow check-in. This is not a recovery decision; reply with \
             complete_task where content is a single sentence of guidance for the \
             next subtask.\n\nObserved signals:\n",
        );
        for line in &described {
            context.push_str(&format!("- {line}\n"));
        }
        if let Some(outcome) = self.oversight.last_nudge() {
            context.push_str(&format!(
                "\nPrevious nudge: \"{}\" -> child finished {}\n",
                outcome.nudge, outcome.child_status
            ));
        }

        let check_in = self
            .run_step(
                Role::Steward,
                task_id,
                &context,
                None,
                StepOverrides::default(),
            )
            .await;

        let nudge = (check_in.result.status == AgentStatus::Completed)
            .then(|| check_in.result.artifact.content.trim().to_string())
            .filter(|n| !n.is_empty());

        self.bus.publish(WorkflowEvent::OversightCheckIn {
            task_id: task_id.to_string(),
            signals: described,
            nudge: nudge.clone(),
        });

        nudge
    }

    // ── Task bookkeeping ───────────────────────────────────────────

    pub(crate) fn create_task(&self, id: &str, description: &str, parent: Option<&str>) {
        let task = Task::new(id, description);
        self.persist(&task);
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(parent_id) = parent {
            if let Some(parent_task) = tasks.get_mut(parent_id) {
                parent_task.children.push(id.to_string());
            }
        }
        tasks.insert(id.to_string(), task);
        if let Some(parent_id) = parent {
            self.org
                .lock()
                .expect("org chart poisoned")
                .add_child(parent_id, id, description);
            self.bus.publish(WorkflowEvent::TaskSubtaskCreated {
                parent_id: parent_id.to_string(),
                task_id: id.to_string(),
                description: description.to_string(),
            });
        }
    }

    pub(crate) fn set_task_status(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(task) = tasks.get_mut(id) {
            task.status = status;
            let snapshot = task.clone();
            drop(tasks);
            self.persist(&snapshot);
            self.bus.publish(WorkflowEvent::TaskStatusChange {
                task_id: id.to_string(),
                status,
            });
        }
    }

    fn set_task_complexity(&self, id: &str, complexity: f64) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(task) = tasks.get_mut(id) {
            task.set_complexity(complexity);
            let snapshot = task.clone();
            drop(tasks);
            self.persist(&snapshot);
        }
    }

    pub(crate) fn record_artifact(&self, id: &str, artifact: Artifact) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(task) = tasks.get_mut(id) {
            task.push_artifact(artifact);
            let snapshot = task.clone();
            drop(tasks);
            self.persist(&snapshot);
        }
    }

    /// Current record for a task, for observability.
    pub fn task_snapshot(&self, id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .expect("task map poisoned")
            .get(id)
            .cloned()
    }

    /// Org chart node for a task, for observability.
    pub fn org_node(&self, task_id: &str) -> Option<crate::task::OrgNode> {
        self.org
            .lock()
            .expect("org chart poisoned")
            .get(task_id)
            .cloned()
    }

    fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(task) {
                tracing::warn!(task_id = %task.id, "Failed to persist task: {e:#}");
            }
        }
    }
}

fn compose_context(parent_context: Option<&str>, body: &str) -> String {
    match parent_context {
        Some(parent) if !parent.is_empty() => format!("{parent}\n\n{body}"),
        _ => body.to_string(),
    }
}

fn splice(mut earlier: Vec<Artifact>, later: Vec<Artifact>) -> Vec<Artifact> {
    earlier.extend(later);
    earlier
}

pub(crate) fn clip(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap).collect();
    out.push('…');
    out
}
