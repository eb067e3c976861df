//! Passive oversight over the event bus.
//!
//! The tracker watches per-step tool usage and derives "the agent may be
//! stuck" signals at `step:complete`. The workflow engine consumes the
//! signals at sequential decomposition boundaries and may request a
//! lightweight steward nudge. Signals clear once consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::agent::AgentStatus;
use crate::events::{EventBus, WorkflowEvent};

/// Signal thresholds, configurable via `oversightThresholds`.
#[derive(Debug, Clone, Copy)]
pub struct OversightThresholds {
    /// Trailing identical tool calls that count as repetition.
    pub repeated_tool_count: usize,
    /// Step duration considered suspiciously long.
    pub long_step_seconds: u64,
}

impl Default for OversightThresholds {
    fn default() -> Self {
        Self {
            repeated_tool_count: 3,
            long_step_seconds: 90,
        }
    }
}

/// One derived signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OversightSignal {
    RepeatedSameTool { tool: String, count: usize },
    LongStepDuration { duration_ms: u64 },
    StepFailedOrNeedsReview { status: AgentStatus },
}

impl OversightSignal {
    pub fn describe(&self) -> String {
        match self {
            OversightSignal::RepeatedSameTool { tool, count } => {
                format!("last {count} tool calls were all `{tool}`")
            }
            OversightSignal::LongStepDuration { duration_ms } => {
                format!("step took {} s", duration_ms / 1000)
            }
            OversightSignal::StepFailedOrNeedsReview { status } => {
                format!("step finished with status {status}")
            }
        }
    }
}

/// Outcome of the last applied nudge, kept for learning.
#[derive(Debug, Clone)]
pub struct NudgeOutcome {
    pub nudge: String,
    pub child_status: AgentStatus,
}

#[derive(Default)]
struct StepState {
    tools: Vec<String>,
}

#[derive(Default)]
struct TrackerState {
    steps: HashMap<String, StepState>,
    agent_to_step: HashMap<String, String>,
    signals: Vec<OversightSignal>,
    last_nudge: Option<NudgeOutcome>,
}

pub struct OversightTracker {
    state: Mutex<TrackerState>,
    thresholds: OversightThresholds,
}

impl OversightTracker {
    pub fn new(thresholds: OversightThresholds) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            thresholds,
        }
    }

    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let tracker = Arc::clone(self);
        bus.subscribe(move |event| tracker.observe(event));
    }

    fn observe(&self, event: &WorkflowEvent) {
        let mut state = self.state.lock().expect("oversight state poisoned");
        match event {
            WorkflowEvent::AgentSpawn {
                agent_id, step_id, ..
            } => {
                state
                    .agent_to_step
                    .insert(agent_id.clone(), step_id.clone());
                state.steps.entry(step_id.clone()).or_default();
            }
            WorkflowEvent::AgentToolCall { agent_id, name, .. } => {
                if let Some(step_id) = state.agent_to_step.get(agent_id).cloned() {
                    if let Some(step) = state.steps.get_mut(&step_id) {
                        step.tools.push(name.clone());
                    }
                }
            }
            WorkflowEvent::StepComplete {
                step_id,
                status,
                duration_ms,
                ..
            } => {
                let step = state.steps.remove(step_id).unwrap_or_default();

                let k = self.thresholds.repeated_tool_count;
                if step.tools.len() >= k {
                    let tail = &step.tools[step.tools.len() - k..];
                    if tail.iter().all(|t| t == &tail[0]) {
                        let signal = OversightSignal::RepeatedSameTool {
                            tool: tail[0].clone(),
                            count: k,
                        };
                        state.signals.push(signal);
                    }
                }

                if *duration_ms > self.thresholds.long_step_seconds * 1000 {
                    state.signals.push(OversightSignal::LongStepDuration {
                        duration_ms: *duration_ms,
                    });
                }

                if *status != AgentStatus::Completed {
                    state
                        .signals
                        .push(OversightSignal::StepFailedOrNeedsReview { status: *status });
                }
            }
            _ => {}
        }
    }

    /// Take and clear the current signal set.
    pub fn take_signals(&self) -> Vec<OversightSignal> {
        std::mem::take(&mut self.state.lock().expect("oversight state poisoned").signals)
    }

    pub fn has_signals(&self) -> bool {
        !self
            .state
            .lock()
            .expect("oversight state poisoned")
            .signals
            .is_empty()
    }

    pub fn record_nudge_outcome(&self, nudge: String, child_status: AgentStatus) {
        self.state
            .lock()
            .expect("oversight state poisoned")
            .last_nudge = Some(NudgeOutcome {
            nudge,
            child_status,
        });
    }

    pub fn last_nudge(&self) -> Option<NudgeOutcome> {
        self.state
            .lock()
            .expect("oversight state poisoned")
            .last_nudge
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;
    use crate::task::TokenUsage;

    fn tracker_on_bus() -> (Arc<OversightTracker>, Arc<EventBus>) {
        let tracker = Arc::new(OversightTracker::new(OversightThresholds::default()));
        let bus = Arc::new(EventBus::new());
        tracker.attach(&bus);
        (tracker, bus)
    }

    fn spawn(bus: &EventBus) {
        bus.publish(WorkflowEvent::AgentSpawn {
            agent_id: "agent-1".to_string(),
            step_id: "step-1".to_string(),
            role: Role::Executor,
        });
    }

    fn tool_call(bus: &EventBus, name: &str) {
        bus.publish(WorkflowEvent::AgentToolCall {
            agent_id: "agent-1".to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({}),
        });
    }

    fn complete(bus: &EventBus, status: AgentStatus, duration_ms: u64) {
        bus.publish(WorkflowEvent::StepComplete {
            step_id: "step-1".to_string(),
            task_id: "task-1".to_string(),
            role: Role::Executor,
            status,
            usage: TokenUsage::default(),
            duration_ms,
            model: "m".to_string(),
        });
    }

    #[test]
    fn repeated_tool_signal_fires_on_trailing_run() {
        let (tracker, bus) = tracker_on_bus();
        spawn(&bus);
        tool_call(&bus, "write_file");
        tool_call(&bus, "read_file");
        tool_call(&bus, "read_file");
        tool_call(&bus, "read_file");
        complete(&bus, AgentStatus::Completed, 1000);

        let signals = tracker.take_signals();
        assert!(signals
            .iter()
            .any(|s| matches!(s, OversightSignal::RepeatedSameTool { tool, .. } if tool == "read_file")));
        // Consumed: cleared.
        assert!(!tracker.has_signals());
    }

    #[test]
    fn mixed_tail_does_not_fire() {
        let (tracker, bus) = tracker_on_bus();
        spawn(&bus);
        tool_call(&bus, "read_file");
        tool_call(&bus, "read_file");
        tool_call(&bus, "write_file");
        complete(&bus, AgentStatus::Completed, 1000);

        assert!(tracker
            .take_signals()
            .iter()
            .all(|s| !matches!(s, OversightSignal::RepeatedSameTool { .. })));
    }

    #[test]
    fn long_duration_and_bad_status_signals() {
        let (tracker, bus) = tracker_on_bus();
        spawn(&bus);
        complete(&bus, AgentStatus::NeedsReview, 95_000);

        let signals = tracker.take_signals();
        assert!(signals
            .iter()
            .any(|s| matches!(s, OversightSignal::LongStepDuration { .. })));
        assert!(signals
            .iter()
            .any(|s| matches!(s, OversightSignal::StepFailedOrNeedsReview { .. })));
    }

    #[test]
    fn nudge_outcome_is_retained() {
        let (tracker, _bus) = tracker_on_bus();
        tracker.record_nudge_outcome("focus on tests".to_string(), AgentStatus::Completed);
        let outcome = tracker.last_nudge().unwrap();
        assert_eq!(outcome.nudge, "focus on tests");
        assert_eq!(outcome.child_status, AgentStatus::Completed);
    }
}
