//! Parsers for each role's `complete_task` payload.
//!
//! Every parser is total and IO-free. Analyzer and planner fall back to
//! safe defaults on malformed input; steward and oracle return `None` and
//! the engine treats that as an escalation.

use serde_json::Value;

/// Typed analyzer output.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOutput {
    /// Complexity score in [0, 1].
    pub complexity: f64,
    pub summary: String,
    pub affected_files: Vec<String>,
    pub recommended_approach: String,
}

/// Subtask definition inside a decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskDef {
    pub description: String,
    pub file_scope: Vec<String>,
    pub skip_analysis: bool,
}

/// Typed planner output.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    Spec {
        spec: String,
        acceptance_criteria: Vec<String>,
        expected_files: Vec<String>,
        file_scope: Vec<String>,
    },
    Decomposition {
        subtasks: Vec<SubtaskDef>,
        parallel: bool,
        setup_task: Option<SubtaskDef>,
        acceptance_criteria: Vec<String>,
    },
}

/// Recovery action chosen by the steward.
#[derive(Debug, Clone, PartialEq)]
pub enum StewardAction {
    RetryMerge,
    RetryChildren {
        indices: Vec<usize>,
        focus: Option<String>,
    },
    AddFixTask {
        description: Option<String>,
    },
    ReDecompose,
    Escalate,
}

/// Action chosen by the oracle.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleAction {
    NudgeRootSteward { message: String },
    RetryOnce { focus: Option<String> },
    EscalateToUser,
}

/// Strip a Markdown code fence (```json … ```), if present.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Best-effort JSON object extraction: direct parse first, then the widest
/// `{…}` slice of the text.
fn extract_json(content: &str) -> Option<Value> {
    let stripped = strip_code_fence(content);
    if let Ok(value) = serde_json::from_str::<Value>(stripped) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&stripped[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn summary_slice(content: &str) -> String {
    content.trim().chars().take(200).collect()
}

/// Map a complexity value to [0, 1]. The strings "simple", "medium" and
/// "complex" map to 0.25, 0.5 and 0.85; out-of-range numbers fall back
/// to 0.5.
pub fn map_complexity(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => {
            let n = n.as_f64().unwrap_or(0.5);
            if (0.0..=1.0).contains(&n) {
                n
            } else {
                0.5
            }
        }
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "simple" => 0.25,
            "medium" => 0.5,
            "complex" => 0.85,
            _ => 0.5,
        },
        _ => 0.5,
    }
}

/// Parse an analyzer payload. Never fails: malformed input yields a medium
/// complexity and a content-slice summary.
pub fn parse_analyzer(content: &str) -> AnalyzerOutput {
    let Some(json) = extract_json(content) else {
        return AnalyzerOutput {
            complexity: 0.5,
            summary: summary_slice(content),
            affected_files: Vec::new(),
            recommended_approach: String::new(),
        };
    };

    AnalyzerOutput {
        complexity: map_complexity(json.get("complexity")),
        summary: json
            .get("summary")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| summary_slice(content)),
        affected_files: string_list(json.get("affectedFiles")),
        recommended_approach: json
            .get("recommendedApproach")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_subtask(value: &Value) -> Option<SubtaskDef> {
    let description = value.get("description").and_then(Value::as_str)?;
    Some(SubtaskDef {
        description: description.to_string(),
        file_scope: string_list(value.get("fileScope")),
        skip_analysis: value
            .get("skipAnalysis")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Parse a planner payload. A `subtasks` array yields a decomposition;
/// anything else yields a spec, falling back to the raw content.
pub fn parse_planner(content: &str) -> PlannerOutput {
    let fallback = || PlannerOutput::Spec {
        spec: content.trim().to_string(),
        acceptance_criteria: Vec::new(),
        expected_files: Vec::new(),
        file_scope: Vec::new(),
    };

    let Some(json) = extract_json(content) else {
        return fallback();
    };

    if let Some(raw_subtasks) = json.get("subtasks").and_then(Value::as_array) {
        let subtasks: Vec<SubtaskDef> = raw_subtasks.iter().filter_map(parse_subtask).collect();
        if !subtasks.is_empty() {
            return PlannerOutput::Decomposition {
                subtasks,
                // Missing `parallel` means sequential; missing `setupTask`
                // means no setup step.
                parallel: json
                    .get("parallel")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                setup_task: json.get("setupTask").and_then(parse_subtask),
                acceptance_criteria: string_list(json.get("acceptanceCriteria")),
            };
        }
    }

    if let Some(spec) = json.get("spec").and_then(Value::as_str) {
        return PlannerOutput::Spec {
            spec: spec.to_string(),
            acceptance_criteria: string_list(json.get("acceptanceCriteria")),
            expected_files: string_list(json.get("expectedFiles")),
            file_scope: string_list(json.get("fileScope")),
        };
    }

    fallback()
}

/// Parse a steward decision. `None` means the engine should escalate.
pub fn parse_steward(content: &str) -> Option<StewardAction> {
    let json = extract_json(content)?;
    let action = json.get("action").and_then(Value::as_str)?;

    match action {
        "retry_merge" => Some(StewardAction::RetryMerge),
        "retry_children" => {
            let indices = json
                .get("taskIndices")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_u64)
                        .map(|n| n as usize)
                        .collect()
                })
                .unwrap_or_default();
            Some(StewardAction::RetryChildren {
                indices,
                focus: json
                    .get("retryFocus")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            })
        }
        "add_fix_task" => Some(StewardAction::AddFixTask {
            description: json
                .get("description")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }),
        "re_decompose" => Some(StewardAction::ReDecompose),
        "escalate" => Some(StewardAction::Escalate),
        _ => None,
    }
}

/// Parse an oracle decision. `None` means escalate to the user.
pub fn parse_oracle(content: &str) -> Option<OracleAction> {
    let json = extract_json(content)?;
    let action = json.get("action").and_then(Value::as_str)?;

    match action {
        "nudge_root_steward" => Some(OracleAction::NudgeRootSteward {
            message: json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "retry_once" => Some(OracleAction::RetryOnce {
            focus: json
                .get("focus")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }),
        "escalate_to_user" => Some(OracleAction::EscalateToUser),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn analyzer_parses_well_formed_json() {
        let content = json!({
            "complexity": 0.2,
            "summary": "Small task",
            "affectedFiles": ["README.md"],
            "recommendedApproach": "Direct implementation"
        })
        .to_string();

        let output = parse_analyzer(&content);
        assert_eq!(output.complexity, 0.2);
        assert_eq!(output.summary, "Small task");
        assert_eq!(output.affected_files, vec!["README.md"]);
    }

    #[test]
    fn analyzer_accepts_code_fences() {
        let content = "```json\n{\"complexity\": \"complex\", \"summary\": \"big\"}\n```";
        let output = parse_analyzer(content);
        assert_eq!(output.complexity, 0.85);
        assert_eq!(output.summary, "big");
    }

    #[test]
    fn analyzer_never_panics_on_garbage() {
        let output = parse_analyzer("not json at all, just prose about the task");
        assert_eq!(output.complexity, 0.5);
        assert!(output.summary.starts_with("not json"));
    }

    #[test]
    fn complexity_string_mapping() {
        assert_eq!(map_complexity(Some(&json!("simple"))), 0.25);
        assert_eq!(map_complexity(Some(&json!("medium"))), 0.5);
        assert_eq!(map_complexity(Some(&json!("complex"))), 0.85);
        assert_eq!(map_complexity(Some(&json!("enormous"))), 0.5);
    }

    #[test]
    fn complexity_out_of_range_falls_back() {
        assert_eq!(map_complexity(Some(&json!(3.5))), 0.5);
        assert_eq!(map_complexity(Some(&json!(-0.1))), 0.5);
        assert_eq!(map_complexity(Some(&json!(0.7))), 0.7);
        assert_eq!(map_complexity(None), 0.5);
    }

    #[test]
    fn planner_parses_spec() {
        let content = json!({
            "spec": "Implement the endpoint",
            "acceptanceCriteria": ["returns 200"],
            "expectedFiles": ["src/api.ts"],
            "fileScope": ["src/"]
        })
        .to_string();

        match parse_planner(&content) {
            PlannerOutput::Spec {
                spec,
                acceptance_criteria,
                file_scope,
                ..
            } => {
                assert_eq!(spec, "Implement the endpoint");
                assert_eq!(acceptance_criteria, vec!["returns 200"]);
                assert_eq!(file_scope, vec!["src/"]);
            }
            other => panic!("expected spec, got {other:?}"),
        }
    }

    #[test]
    fn planner_parses_decomposition_with_defaults() {
        let content = json!({
            "subtasks": [
                {"description": "build API", "fileScope": ["src/api"]},
                {"description": "build UI", "fileScope": ["src/ui"], "skipAnalysis": true}
            ]
        })
        .to_string();

        match parse_planner(&content) {
            PlannerOutput::Decomposition {
                subtasks,
                parallel,
                setup_task,
                ..
            } => {
                assert_eq!(subtasks.len(), 2);
                assert!(!parallel, "missing parallel must default to false");
                assert!(setup_task.is_none());
                assert!(subtasks[1].skip_analysis);
            }
            other => panic!("expected decomposition, got {other:?}"),
        }
    }

    #[test]
    fn planner_falls_back_to_raw_spec() {
        match parse_planner("just do the thing carefully") {
            PlannerOutput::Spec {
                spec,
                acceptance_criteria,
                ..
            } => {
                assert_eq!(spec, "just do the thing carefully");
                assert!(acceptance_criteria.is_empty());
            }
            other => panic!("expected fallback spec, got {other:?}"),
        }
    }

    #[test]
    fn steward_actions_parse() {
        assert_eq!(
            parse_steward(r#"{"action":"retry_merge"}"#),
            Some(StewardAction::RetryMerge)
        );
        assert_eq!(
            parse_steward(r#"{"action":"retry_children","taskIndices":[1],"retryFocus":"Fix Y"}"#),
            Some(StewardAction::RetryChildren {
                indices: vec![1],
                focus: Some("Fix Y".to_string())
            })
        );
        assert_eq!(
            parse_steward(r#"{"action":"re_decompose"}"#),
            Some(StewardAction::ReDecompose)
        );
        assert_eq!(parse_steward("total nonsense"), None);
        assert_eq!(parse_steward(r#"{"action":"do_magic"}"#), None);
    }

    #[test]
    fn oracle_actions_parse() {
        assert_eq!(
            parse_oracle(r#"{"action":"nudge_root_steward","message":"try retry_merge"}"#),
            Some(OracleAction::NudgeRootSteward {
                message: "try retry_merge".to_string()
            })
        );
        assert_eq!(
            parse_oracle(r#"{"action":"retry_once"}"#),
            Some(OracleAction::RetryOnce { focus: None })
        );
        assert_eq!(
            parse_oracle(r#"{"action":"escalate_to_user"}"#),
            Some(OracleAction::EscalateToUser)
        );
        assert_eq!(parse_oracle(""), None);
    }

    #[test]
    fn json_embedded_in_prose_is_found() {
        let content = "Here is my decision:\n{\"action\": \"retry_merge\"}\nThanks.";
        assert_eq!(parse_steward(content), Some(StewardAction::RetryMerge));
    }
}
