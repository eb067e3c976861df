//! Canonical event protocol and the in-process event bus.
//!
//! `WorkflowEvent` is the single source of truth for everything the engine,
//! agents and trackers emit. Renderers, persistence and the cost tracker are
//! all plain subscribers; none of them is consulted synchronously for
//! decisions.
//!
//! Delivery is synchronous within the producer's call, in registration
//! order. A panicking subscriber never breaks delivery to the others.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::agent::AgentStatus;
use crate::roles::Role;
use crate::task::{TaskStatus, TokenUsage};

/// Events emitted on the bus. Each variant is a discrete state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStart {
        task_id: String,
        description: String,
    },
    WorkflowComplete {
        task_id: String,
        status: TaskStatus,
        duration_ms: u64,
    },

    StepStart {
        step_id: String,
        task_id: String,
        role: Role,
    },
    StepComplete {
        step_id: String,
        task_id: String,
        role: Role,
        status: AgentStatus,
        usage: TokenUsage,
        duration_ms: u64,
        model: String,
    },
    StepRetry {
        step_id: String,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },

    AgentSpawn {
        agent_id: String,
        step_id: String,
        role: Role,
    },
    AgentTurn {
        agent_id: String,
        turn: u32,
        max_turns: u32,
    },
    AgentToolCall {
        agent_id: String,
        name: String,
        arguments: Value,
    },
    AgentContent {
        agent_id: String,
        content: String,
    },
    AgentToolResult {
        agent_id: String,
        name: String,
        is_error: bool,
        duration_ms: u64,
    },
    AgentComplete {
        agent_id: String,
        role: Role,
        status: AgentStatus,
        summary: String,
    },

    SubtaskStart {
        task_id: String,
        parent_id: String,
        index: usize,
        description: String,
    },
    SubtaskComplete {
        task_id: String,
        parent_id: String,
        index: usize,
        status: TaskStatus,
    },

    TaskStatusChange {
        task_id: String,
        status: TaskStatus,
    },
    TaskSubtaskCreated {
        parent_id: String,
        task_id: String,
        description: String,
    },

    /// Per-turn usage delta plus the agent's running total.
    TokenUpdate {
        agent_id: String,
        role: Role,
        model: String,
        usage: TokenUsage,
        cumulative: TokenUsage,
    },
    CostUpdate {
        total_cost: f64,
        by_role: HashMap<String, f64>,
        by_model: HashMap<String, f64>,
    },

    CompositeCycleStart {
        task_id: String,
        cycle: u32,
        max_cycles: u32,
    },

    OracleInvoked {
        snapshot_summary: String,
    },
    OracleDecision {
        action: String,
    },

    OversightCheckIn {
        task_id: String,
        signals: Vec<String>,
        nudge: Option<String>,
    },
}

type Subscriber = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Identifier returned by `subscribe`, used to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Fan-out publish/subscribe bus. Per-run, not process-global: the engine
/// takes it as an explicit argument so multiple runs can coexist.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push((id, Arc::new(subscriber)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .retain(|(sub_id, _)| *sub_id != id.0);
    }

    /// Deliver an event to all subscribers in registration order.
    ///
    /// The subscriber list lock is not held during delivery, so subscribers
    /// may publish follow-up events (the cost tracker does).
    pub fn publish(&self, event: WorkflowEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                tracing::error!("event subscriber panicked; continuing delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_event() -> WorkflowEvent {
        WorkflowEvent::WorkflowStart {
            task_id: "t1".to_string(),
            description: "test".to_string(),
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        bus.publish(dummy_event());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_subscriber_does_not_break_others() {
        let bus = EventBus::new();
        let delivered = Arc::new(Mutex::new(0usize));

        bus.subscribe(|_| panic!("subscriber bug"));
        {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| *delivered.lock().unwrap() += 1);
        }

        bus.publish(dummy_event());
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_detaches() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0usize));

        let id = {
            let count = Arc::clone(&count);
            bus.subscribe(move |_| *count.lock().unwrap() += 1)
        };

        bus.publish(dummy_event());
        bus.unsubscribe(id);
        bus.publish(dummy_event());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn subscriber_may_republish() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let bus_clone = Arc::clone(&bus);
            bus.subscribe(move |event| {
                if matches!(event, WorkflowEvent::WorkflowStart { .. }) {
                    bus_clone.publish(WorkflowEvent::CostUpdate {
                        total_cost: 0.0,
                        by_role: HashMap::new(),
                        by_model: HashMap::new(),
                    });
                }
            });
        }
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| {
                seen.lock().unwrap().push(std::mem::discriminant(event));
            });
        }

        bus.publish(dummy_event());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
    }
}
