//! End-to-end workflow scenarios over a scripted provider.
//!
//! Each test wires a real engine (bus, oversight, tools, temp workspace)
//! to a provider that replays canned responses, then asserts on the
//! workflow outcome and the event stream.

use std::sync::{Arc, Mutex};

use babylon_core::cancellation::CancellationHandle;
use babylon_core::events::{EventBus, WorkflowEvent};
use babylon_core::oversight::{OversightThresholds, OversightTracker};
use babylon_core::roles::Role;
use babylon_core::task::TaskStatus;
use babylon_core::test_support::{
    complete_response, complete_response_with, tool_call_response, MockOutcome, ScriptedProvider,
};
use babylon_core::workflow::{ModelSelection, WorkflowEngine, WorkflowOptions};
use serde_json::json;

struct Harness {
    engine: Arc<WorkflowEngine>,
    provider: Arc<ScriptedProvider>,
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
    _dir: tempfile::TempDir,
}

fn harness(script: Vec<MockOutcome>) -> Harness {
    harness_with_options(script, WorkflowOptions {
        oversight_probability: 0.0,
        ..WorkflowOptions::default()
    })
}

fn harness_with_options(script: Vec<MockOutcome>, options: WorkflowOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(script));
    let bus = Arc::new(EventBus::new());

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        bus.subscribe(move |event| events.lock().unwrap().push(event.clone()));
    }

    let oversight = Arc::new(OversightTracker::new(OversightThresholds::default()));
    oversight.attach(&bus);

    let engine = WorkflowEngine::new(
        ModelSelection::new(
            Arc::clone(&provider) as Arc<dyn babylon_core::ai::Provider>,
            "test-model",
        ),
        bus,
        CancellationHandle::new(),
        oversight,
        None,
        dir.path().to_path_buf(),
        options,
    );

    Harness {
        engine,
        provider,
        events,
        _dir: dir,
    }
}

fn analyzer_response(complexity: f64) -> MockOutcome {
    complete_response(
        "completed",
        "Analyzed",
        &json!({
            "complexity": complexity,
            "summary": "Small task",
            "affectedFiles": [],
            "recommendedApproach": "Direct implementation"
        })
        .to_string(),
    )
}

fn spec_response() -> MockOutcome {
    complete_response(
        "completed",
        "Planned",
        &json!({
            "spec": "Add validation for field X",
            "acceptanceCriteria": ["field X is validated"],
            "expectedFiles": ["src/form.ts"],
            "fileScope": ["src/"]
        })
        .to_string(),
    )
}

fn decomposition_response(parallel: bool) -> MockOutcome {
    complete_response(
        "completed",
        "Planned",
        &json!({
            "subtasks": [
                {"description": "Build the API endpoint", "fileScope": ["src/"], "skipAnalysis": true},
                {"description": "Build the UI form", "fileScope": ["src/"], "skipAnalysis": true}
            ],
            "parallel": parallel
        })
        .to_string(),
    )
}

fn events_of(harness: &Harness) -> Vec<WorkflowEvent> {
    harness.events.lock().unwrap().clone()
}

fn subtask_starts(events: &[WorkflowEvent]) -> Vec<(usize, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::SubtaskStart { index, task_id, .. } => Some((*index, task_id.clone())),
            _ => None,
        })
        .collect()
}

// ── Scenario A: simple direct path ─────────────────────────────────────

#[tokio::test]
async fn simple_task_skips_the_planner() {
    let h = harness(vec![
        analyzer_response(0.2),
        complete_response("completed", "Comment added", "README updated"),
        complete_response("completed", "Looks good", "approved"),
    ]);

    let report = h.engine.run("Add a comment to the README", "root-1").await;
    assert_eq!(report.status, TaskStatus::Completed);
    assert!(!report.artifacts.is_empty());

    let events = events_of(&h);

    let planner_steps = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepStart { role: Role::Planner, .. }))
        .count();
    assert_eq!(planner_steps, 0, "planner must not run on the direct path");

    let starts: Vec<&WorkflowEvent> = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::WorkflowStart { .. }))
        .collect();
    let completes: Vec<&WorkflowEvent> = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::WorkflowComplete { .. }))
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(completes.len(), 1);
    if let (
        WorkflowEvent::WorkflowStart { task_id: started, .. },
        WorkflowEvent::WorkflowComplete { task_id: completed, .. },
    ) = (starts[0], completes[0])
    {
        assert_eq!(started, completed);
        assert_eq!(started, "root-1");
    }

    let tokens_seen = events.iter().any(|e| {
        matches!(e, WorkflowEvent::TokenUpdate { cumulative, .. } if cumulative.total_tokens > 0)
    });
    assert!(tokens_seen, "cumulative token usage must be positive");
}

// ── Scenario B: medium backslip ────────────────────────────────────────

#[tokio::test]
async fn reviewer_backslip_reruns_the_executor() {
    let h = harness(vec![
        analyzer_response(0.5),
        spec_response(),
        complete_response("completed", "Implemented", "wrote form handler"),
        complete_response_with(
            "needs_review",
            "Found an issue",
            "the form misses validation",
            json!({"review_notes": "Missing validation on field X"}),
        ),
        complete_response("completed", "Fixed", "validation added"),
        complete_response("completed", "Looks good", "approved"),
    ]);

    let report = h.engine.run("Add a form", "root-b").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    let retries = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepRetry { .. }))
        .count();
    assert_eq!(retries, 1, "exactly one step retry expected");

    // Call order: analyzer, planner, executor, reviewer, executor, reviewer.
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 6);
    let revision_context = requests[4].messages[0].text();
    assert!(revision_context.contains("--- REVISION REQUIRED ---"));
    assert!(revision_context.contains("Missing validation on field X"));
}

// ── Scenario C: parallel plan downgraded on overlapping scopes ─────────

#[tokio::test]
async fn overlapping_scopes_downgrade_to_sequential() {
    let h = harness(vec![
        analyzer_response(0.8),
        decomposition_response(true),
        // Child 1: executor + reviewer.
        complete_response("completed", "API built", "endpoint in place"),
        complete_response("completed", "API reviewed", "approved"),
        // Child 2: executor + reviewer.
        complete_response("completed", "UI built", "form in place"),
        complete_response("completed", "UI reviewed", "approved"),
        // Coordinator merge.
        complete_response("completed", "Merged", "all tests pass"),
    ]);

    let report = h.engine.run("Build the feature", "root-c").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    let starts = subtask_starts(&events);
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].0, 0);
    assert_eq!(starts[1].0, 1);

    // Sequential execution: the first subtask completes before the second
    // starts. No subtask is lost in the downgrade.
    let first_complete = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::SubtaskComplete { index: 0, .. }))
        .unwrap();
    let second_start = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::SubtaskStart { index: 1, .. }))
        .unwrap();
    assert!(first_complete < second_start);

    // The root is labeled a composite with a steward attached.
    let root = h.engine.org_node("root-c").unwrap();
    assert!(root.has_steward);
    let complexity = h.engine.task_snapshot("root-c").unwrap().complexity;
    assert_eq!(complexity, Some(0.8));
}

// ── Disjoint scopes run truly in parallel ──────────────────────────────

#[tokio::test]
async fn disjoint_scopes_run_in_parallel() {
    let disjoint_plan = complete_response(
        "completed",
        "Planned",
        &json!({
            "subtasks": [
                {"description": "Build the API endpoint", "fileScope": ["src/api"], "skipAnalysis": true},
                {"description": "Build the UI form", "fileScope": ["src/ui"], "skipAnalysis": true}
            ],
            "parallel": true
        })
        .to_string(),
    );
    // Child agents interleave freely, so every child response is identical
    // and role-agnostic; the coordinator runs after the join barrier.
    let h = harness(vec![
        analyzer_response(0.8),
        disjoint_plan,
        complete_response("completed", "done", "ok"),
        complete_response("completed", "done", "ok"),
        complete_response("completed", "done", "ok"),
        complete_response("completed", "done", "ok"),
        complete_response("completed", "Merged", "all tests pass"),
    ]);

    let report = h.engine.run("Build the feature", "root-p").await;
    assert_eq!(report.status, TaskStatus::Completed);

    // Parallel semantics: both subtask starts are emitted before any
    // subtask completion.
    let events = events_of(&h);
    let last_start = events
        .iter()
        .rposition(|e| matches!(e, WorkflowEvent::SubtaskStart { .. }))
        .unwrap();
    let first_complete = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::SubtaskComplete { .. }))
        .unwrap();
    assert!(last_start < first_complete);
}

// ── Scenario D: steward retry_children ─────────────────────────────────

#[tokio::test]
async fn steward_retries_a_failed_child() {
    let h = harness(vec![
        analyzer_response(0.8),
        decomposition_response(false),
        complete_response("completed", "API built", "endpoint in place"),
        complete_response("completed", "API reviewed", "approved"),
        complete_response("completed", "UI built", "form in place"),
        complete_response("completed", "UI reviewed", "approved"),
        // Coordinator finds an integration problem.
        complete_response_with(
            "needs_review",
            "Criterion missed",
            "merge looks incomplete",
            json!({"review_notes": "Subtask 2 missed acceptance criterion Y"}),
        ),
        // Steward decides to retry the second child with focus.
        complete_response(
            "completed",
            "Retrying child",
            &json!({"action": "retry_children", "taskIndices": [1], "retryFocus": "Fix Y"})
                .to_string(),
        ),
        // Child 2 rerun: executor + reviewer.
        complete_response("completed", "UI fixed", "criterion Y satisfied"),
        complete_response("completed", "UI re-reviewed", "approved"),
        // Coordinator passes on the second attempt.
        complete_response("completed", "Merged", "all tests pass"),
    ]);

    let report = h.engine.run("Build the feature", "root-d").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    let starts = subtask_starts(&events);
    let second_child: Vec<&(usize, String)> = starts.iter().filter(|(i, _)| *i == 1).collect();
    assert_eq!(second_child.len(), 2, "subtask 2 must run twice");
    assert_eq!(
        second_child[0].1, second_child[1].1,
        "the rerun targets the same task"
    );

    // The rerun executor receives the steward focus in its context.
    let requests = h.provider.requests();
    let rerun_context = requests[8].messages[0].text();
    assert!(rerun_context.contains("Fix Y"));
    assert!(rerun_context.contains("Steward voice"));
}

// ── Scenario E: blocked command inside an agent turn ───────────────────

#[tokio::test]
async fn blocked_command_is_rejected_and_conversation_continues() {
    let h = harness(vec![
        analyzer_response(0.2),
        tool_call_response("run_terminal_command", json!({"command": "rm -rf /"})),
        complete_response("completed", "Done without the rm", "cleaned up properly"),
        complete_response("completed", "Looks good", "approved"),
    ]);

    let report = h.engine.run("Tidy the workspace", "root-e").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    let blocked = events.iter().any(|e| {
        matches!(
            e,
            WorkflowEvent::AgentToolResult { name, is_error: true, .. }
                if name == "run_terminal_command"
        )
    });
    assert!(blocked, "the dangerous command must surface as a tool error");

    // The error went back to the model as a tool result.
    let requests = h.provider.requests();
    let saw_block = requests[2].messages.iter().any(|m| {
        m.content.iter().any(|c| {
            matches!(
                c,
                babylon_core::ai::Content::ToolResult { output, is_error: true, .. }
                    if output.contains("blocked")
            )
        })
    });
    assert!(saw_block);
}

// ── Scenario F: stuck loop ─────────────────────────────────────────────

#[tokio::test]
async fn stuck_executor_is_cut_off_with_needs_review() {
    let same_read = || tool_call_response("read_file", json!({"path": "README.md"}));
    let h = harness(vec![
        analyzer_response(0.2),
        same_read(),
        same_read(),
        same_read(),
        // Reviewer still judges the (empty) work.
        complete_response("completed", "Nothing broken", "approved"),
    ]);

    let report = h.engine.run("Tweak the README", "root-f").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    let stuck = events.iter().any(|e| {
        matches!(
            e,
            WorkflowEvent::AgentComplete { status: babylon_core::AgentStatus::NeedsReview, summary, .. }
                if summary.contains("stuck")
        )
    });
    assert!(stuck, "executor must finalize as stuck");
}

// ── Recursion bound ────────────────────────────────────────────────────

#[tokio::test]
async fn max_depth_forces_single_unit_implementation() {
    let h = harness_with_options(
        vec![
            analyzer_response(0.8),
            decomposition_response(true),
            // Forced spec mode: executor + reviewer, no subtasks.
            complete_response("completed", "Implemented whole", "did everything"),
            complete_response("completed", "Reviewed", "approved"),
        ],
        WorkflowOptions {
            max_depth: 0,
            oversight_probability: 0.0,
            ..WorkflowOptions::default()
        },
    );

    let report = h.engine.run("Build the feature", "root-g").await;
    assert_eq!(report.status, TaskStatus::Completed);

    let events = events_of(&h);
    assert!(
        subtask_starts(&events).is_empty(),
        "no subtasks may run at max depth"
    );
}
