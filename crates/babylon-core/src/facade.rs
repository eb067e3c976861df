//! Run facade: wires providers, bus, persistence, cost tracking and the
//! workflow engine together for one task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ai::{AnthropicProvider, OpenAiProvider, Provider};
use crate::cancellation::CancellationHandle;
use crate::config::BabylonConfig;
use crate::cost::{CostBreakdown, CostTracker};
use crate::error::{BabylonError, Result};
use crate::events::{EventBus, WorkflowEvent};
use crate::oversight::OversightTracker;
use crate::persistence::TaskStore;
use crate::task::{new_task_id, Artifact, TaskStatus, TokenUsage};
use crate::workflow::{ModelSelection, WorkflowEngine};

const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const ANTHROPIC_ECONOMY_MODEL: &str = "claude-haiku-4-5";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
const OPENAI_ECONOMY_MODEL: &str = "gpt-4o-mini";

/// Final result of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub artifacts: Vec<Artifact>,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub duration: Duration,
}

impl RunResult {
    /// Reason line shown when the run did not complete.
    pub fn failure_reason(&self) -> Option<&str> {
        if self.status == TaskStatus::Completed {
            return None;
        }
        self.artifacts.last().map(|a| a.content.as_str())
    }
}

pub struct Babylon {
    config: BabylonConfig,
    bus: Arc<EventBus>,
    cancellation: CancellationHandle,
    models: ModelSelection,
    store: Arc<TaskStore>,
    cost: Arc<CostTracker>,
    oversight: Arc<OversightTracker>,
    usage: Arc<Mutex<TokenUsage>>,
}

impl std::fmt::Debug for Babylon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Babylon").finish_non_exhaustive()
    }
}

impl Babylon {
    /// Build a run facade. Fails fast on configuration problems, before
    /// any LLM call.
    pub fn new(config: BabylonConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let cancellation = CancellationHandle::new();

        // One provider instance per supplied API key.
        let mut providers: HashMap<&'static str, Arc<dyn Provider>> = HashMap::new();
        if let Some(key) = &config.anthropic_api_key {
            providers.insert("anthropic", Arc::new(AnthropicProvider::new(key.clone())));
        }
        if let Some(key) = &config.openai_api_key {
            providers.insert("openai", Arc::new(OpenAiProvider::new(key.clone())));
        }
        if providers.is_empty() {
            return Err(BabylonError::Configuration(
                "no API key configured; set ANTHROPIC_API_KEY or OPENAI_API_KEY".to_string(),
            ));
        }

        let provider_name = match config.default_provider.as_deref() {
            Some(name) => name.to_string(),
            None if providers.contains_key("anthropic") => "anthropic".to_string(),
            None => "openai".to_string(),
        };
        let provider = providers
            .get(provider_name.as_str())
            .cloned()
            .ok_or_else(|| {
                BabylonError::Configuration(format!(
                    "provider '{provider_name}' selected but no matching API key is configured"
                ))
            })?;

        let (default_model, economy_model) = match provider_name.as_str() {
            "openai" => (OPENAI_DEFAULT_MODEL, OPENAI_ECONOMY_MODEL),
            _ => (ANTHROPIC_DEFAULT_MODEL, ANTHROPIC_ECONOMY_MODEL),
        };
        let mut models = ModelSelection::new(
            provider,
            config
                .default_model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
        );
        models.reviewer_model = config.reviewer_model.clone();
        models.economy_model = Some(economy_model.to_string());

        let store = Arc::new(
            TaskStore::new(config.persistence_path())
                .map_err(|e| BabylonError::Configuration(format!("persistence: {e:#}")))?,
        );

        let cost = Arc::new(CostTracker::new(
            config.budget_dollars,
            cancellation.clone(),
        ));
        cost.attach(&bus);

        let oversight = Arc::new(OversightTracker::new(config.oversight_thresholds));
        oversight.attach(&bus);

        let usage = Arc::new(Mutex::new(TokenUsage::default()));
        {
            let usage = Arc::clone(&usage);
            bus.subscribe(move |event| {
                if let WorkflowEvent::TokenUpdate { usage: delta, .. } = event {
                    usage.lock().expect("usage poisoned").add(*delta);
                }
            });
        }

        Ok(Self {
            config,
            bus,
            cancellation,
            models,
            store,
            cost,
            oversight,
            usage,
        })
    }

    /// The event bus, for attaching renderers and other subscribers.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Trigger cancellation across every running agent and tool call.
    pub fn abort(&self) {
        self.cancellation.cancel();
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Run one task to completion and assemble the final result.
    pub async fn run(&self, description: &str) -> RunResult {
        let task_id = new_task_id();
        let engine = WorkflowEngine::new(
            self.models.clone(),
            Arc::clone(&self.bus),
            self.cancellation.clone(),
            Arc::clone(&self.oversight),
            Some(Arc::clone(&self.store)),
            self.config.working_directory.clone(),
            self.config.workflow_options(),
        );

        let report = engine.run(description, &task_id).await;

        RunResult {
            task_id: report.task_id,
            status: report.status,
            artifacts: report.artifacts,
            usage: *self.usage.lock().expect("usage poisoned"),
            cost: self.cost.breakdown(),
            duration: Duration::from_millis(report.duration_ms),
        }
    }
}
