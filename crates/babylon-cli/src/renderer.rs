//! Renderers: presentation-only subscribers on the event bus.

use std::sync::Arc;

use babylon_core::config::RendererKind;
use babylon_core::events::{EventBus, WorkflowEvent};

pub fn attach(kind: RendererKind, bus: &Arc<EventBus>) {
    match kind {
        RendererKind::Terminal => {
            bus.subscribe(render_terminal);
        }
        RendererKind::Log => {
            bus.subscribe(render_log);
        }
        RendererKind::None => {}
    }
}

fn render_terminal(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::WorkflowStart { description, .. } => {
            println!("▶ {description}");
        }
        WorkflowEvent::WorkflowComplete {
            status,
            duration_ms,
            ..
        } => {
            println!("■ workflow {status} in {:.1}s", *duration_ms as f64 / 1000.0);
        }
        WorkflowEvent::StepStart { role, .. } => {
            println!("  ◆ {role} started");
        }
        WorkflowEvent::StepComplete {
            role,
            status,
            duration_ms,
            usage,
            ..
        } => {
            println!(
                "  ◇ {role} {status} ({:.1}s, {} tokens)",
                *duration_ms as f64 / 1000.0,
                usage.total_tokens
            );
        }
        WorkflowEvent::StepRetry {
            attempt, reason, ..
        } => {
            println!("  ↻ retry #{attempt}: {}", first_line(reason));
        }
        WorkflowEvent::AgentContent { content, .. } => {
            for line in content.lines().take(4) {
                println!("    │ {line}");
            }
        }
        WorkflowEvent::AgentToolCall { name, .. } => {
            println!("    → {name}");
        }
        WorkflowEvent::AgentToolResult {
            name,
            is_error: true,
            ..
        } => {
            println!("    ✗ {name} failed");
        }
        WorkflowEvent::SubtaskStart {
            index, description, ..
        } => {
            println!("  ├ subtask {index}: {description}");
        }
        WorkflowEvent::SubtaskComplete { index, status, .. } => {
            println!("  └ subtask {index}: {status}");
        }
        WorkflowEvent::CompositeCycleStart { cycle, max_cycles, .. } => {
            println!("  ⟳ composite QA cycle {cycle}/{max_cycles}");
        }
        WorkflowEvent::OracleInvoked { .. } => {
            println!("  ☉ consulting the oracle");
        }
        WorkflowEvent::OracleDecision { action } => {
            println!("  ☉ oracle: {action}");
        }
        WorkflowEvent::OversightCheckIn { nudge, .. } => match nudge {
            Some(nudge) => println!("  ☑ oversight nudge: {}", first_line(nudge)),
            None => println!("  ☑ oversight check-in"),
        },
        WorkflowEvent::CostUpdate { total_cost, .. } => {
            // Single carriage-return style line would fight the other
            // output; keep cost quiet until it grows.
            if *total_cost >= 0.01 {
                tracing::debug!(total_cost, "cost update");
            }
        }
        _ => {}
    }
}

fn render_log(event: &WorkflowEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(target: "babylon::events", "{json}"),
        Err(e) => tracing::warn!("unserializable event: {e}"),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}
