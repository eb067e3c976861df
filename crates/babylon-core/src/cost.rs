//! Dollar cost tracking and budget enforcement.
//!
//! The tracker subscribes to `token:update` events, prices each usage delta
//! with a per-model table, publishes a `cost:update` after every change,
//! and requests cancellation when a configured budget is exceeded. Costing
//! at token granularity (rather than per step) means the budget ceiling is
//! observed before the next agent turn starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::cancellation::CancellationHandle;
use crate::events::{EventBus, WorkflowEvent};
use crate::task::TokenUsage;

/// (model prefix, input $/M tokens, output $/M tokens)
static MODEL_PRICES: Lazy<Vec<(&'static str, f64, f64)>> = Lazy::new(|| {
    vec![
        ("claude-opus", 15.0, 75.0),
        ("claude-sonnet", 3.0, 15.0),
        ("claude-haiku", 0.8, 4.0),
        ("gpt-5", 1.25, 10.0),
        ("gpt-4o-mini", 0.15, 0.6),
        ("gpt-4o", 2.5, 10.0),
        ("o3", 2.0, 8.0),
    ]
});

/// Fallback for unknown models.
const DEFAULT_PRICE: (f64, f64) = (3.0, 15.0);

/// Price one usage delta in dollars.
pub fn price_usage(model: &str, usage: &TokenUsage) -> f64 {
    let (input, output) = MODEL_PRICES
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICE);
    usage.prompt_tokens as f64 / 1_000_000.0 * input
        + usage.completion_tokens as f64 / 1_000_000.0 * output
}

/// Final cost breakdown surfaced in the run result.
#[derive(Debug, Clone, Default)]
pub struct CostBreakdown {
    pub total: f64,
    pub by_role: HashMap<String, f64>,
    pub by_model: HashMap<String, f64>,
}

#[derive(Default)]
struct CostState {
    total: f64,
    by_role: HashMap<String, f64>,
    by_model: HashMap<String, f64>,
    budget_breached: bool,
}

pub struct CostTracker {
    state: Mutex<CostState>,
    budget_dollars: Option<f64>,
    cancellation: CancellationHandle,
}

impl CostTracker {
    pub fn new(budget_dollars: Option<f64>, cancellation: CancellationHandle) -> Self {
        Self {
            state: Mutex::new(CostState::default()),
            budget_dollars,
            cancellation,
        }
    }

    /// Subscribe to the bus. Publishes `cost:update` after each costed
    /// token update.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let tracker = Arc::clone(self);
        let bus_for_updates = Arc::clone(bus);
        bus.subscribe(move |event| {
            let WorkflowEvent::TokenUpdate {
                role, model, usage, ..
            } = event
            else {
                return;
            };
            if let Some(update) = tracker.record(role.as_str(), model, usage) {
                bus_for_updates.publish(update);
            }
        });
    }

    fn record(&self, role: &str, model: &str, usage: &TokenUsage) -> Option<WorkflowEvent> {
        let delta = price_usage(model, usage);
        let mut state = self.state.lock().expect("cost state poisoned");
        state.total += delta;
        *state.by_role.entry(role.to_string()).or_default() += delta;
        *state.by_model.entry(model.to_string()).or_default() += delta;

        let update = WorkflowEvent::CostUpdate {
            total_cost: state.total,
            by_role: state.by_role.clone(),
            by_model: state.by_model.clone(),
        };

        if let Some(budget) = self.budget_dollars {
            if state.total > budget && !state.budget_breached {
                state.budget_breached = true;
                tracing::warn!(
                    total_cost = state.total,
                    budget_dollars = budget,
                    "Budget exceeded, cancelling run"
                );
                drop(state);
                self.cancellation.cancel();
                return Some(update);
            }
        }
        Some(update)
    }

    pub fn breakdown(&self) -> CostBreakdown {
        let state = self.state.lock().expect("cost state poisoned");
        CostBreakdown {
            total: state.total,
            by_role: state.by_role.clone(),
            by_model: state.by_model.clone(),
        }
    }
}
