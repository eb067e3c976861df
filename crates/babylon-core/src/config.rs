//! Run configuration: `.babylonrc.json`, environment, `.env`.
//!
//! Precedence is CLI > environment > config file; the CLI layer applies its
//! own overrides after `load`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::oversight::OversightThresholds;
use crate::workflow::WorkflowOptions;

pub const CONFIG_FILE_NAME: &str = ".babylonrc.json";

/// Which renderer subscribes to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererKind {
    #[default]
    Terminal,
    Log,
    None,
}

impl FromStr for RendererKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminal" => Ok(RendererKind::Terminal),
            "log" => Ok(RendererKind::Log),
            "none" => Ok(RendererKind::None),
            other => Err(format!("unknown renderer '{other}' (terminal|log|none)")),
        }
    }
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct BabylonConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub working_directory: PathBuf,
    pub persistence_path: Option<PathBuf>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub renderer: RendererKind,
    pub max_depth: u32,
    pub max_retries: u32,
    pub max_composite_cycles: u32,
    pub budget_dollars: Option<f64>,
    pub use_cli: bool,
    pub simple_path_max_turns: Option<u32>,
    pub verbose: bool,
    pub run_log_path: Option<PathBuf>,
    pub reviewer_model: Option<String>,
    pub economy_mode: bool,
    pub complexity_direct_threshold: f64,
    pub max_context_turns: Option<usize>,
    pub oversight_probability: f64,
    pub max_oversight_per_composite: u32,
    pub oversight_thresholds: OversightThresholds,
}

impl BabylonConfig {
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            openai_api_key: None,
            anthropic_api_key: None,
            working_directory,
            persistence_path: None,
            default_provider: None,
            default_model: None,
            renderer: RendererKind::default(),
            max_depth: 2,
            max_retries: 2,
            max_composite_cycles: 2,
            budget_dollars: None,
            use_cli: true,
            simple_path_max_turns: None,
            verbose: false,
            run_log_path: None,
            reviewer_model: None,
            economy_mode: false,
            complexity_direct_threshold: 0.35,
            max_context_turns: None,
            oversight_probability: 0.25,
            max_oversight_per_composite: 2,
            oversight_thresholds: OversightThresholds::default(),
        }
    }

    /// Resolve config for a working directory: defaults, then
    /// `.babylonrc.json`, then `.env` and process environment.
    pub fn load(working_directory: PathBuf) -> Result<Self> {
        let mut config = Self::new(working_directory.clone());

        let file_path = working_directory.join(CONFIG_FILE_NAME);
        if file_path.exists() {
            let raw = std::fs::read_to_string(&file_path)
                .with_context(|| format!("failed to read {}", file_path.display()))?;
            let file: ConfigFile = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", file_path.display()))?;
            config.apply_file(file);
        }

        // .env first so real environment variables win over it.
        let env_path = working_directory.join(".env");
        if let Ok(raw) = std::fs::read_to_string(&env_path) {
            for (key, value) in parse_env_file(&raw) {
                match key.as_str() {
                    "OPENAI_API_KEY" if config.openai_api_key.is_none() => {
                        config.openai_api_key = Some(value);
                    }
                    "ANTHROPIC_API_KEY" if config.anthropic_api_key.is_none() => {
                        config.anthropic_api_key = Some(value);
                    }
                    _ => {}
                }
            }
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.openai_api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                config.anthropic_api_key = Some(key);
            }
        }

        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.openai_api_key {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = file.anthropic_api_key {
            self.anthropic_api_key = Some(v);
        }
        if let Some(v) = file.working_directory {
            self.working_directory = PathBuf::from(v);
        }
        if let Some(v) = file.persistence_path {
            self.persistence_path = Some(PathBuf::from(v));
        }
        if let Some(v) = file.default_provider {
            self.default_provider = Some(v);
        }
        if let Some(v) = file.default_model {
            self.default_model = Some(v);
        }
        if let Some(v) = file.renderer {
            if let Ok(kind) = v.parse() {
                self.renderer = kind;
            }
        }
        if let Some(v) = file.max_depth {
            self.max_depth = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.max_composite_cycles {
            self.max_composite_cycles = v;
        }
        if let Some(v) = file.budget_dollars {
            self.budget_dollars = Some(v);
        }
        if let Some(v) = file.use_cli {
            self.use_cli = v;
        }
        if let Some(v) = file.simple_path_max_turns {
            self.simple_path_max_turns = Some(v);
        }
        if let Some(v) = file.verbose {
            self.verbose = v;
        }
        if let Some(v) = file.run_log_path {
            self.run_log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = file.reviewer_model {
            self.reviewer_model = Some(v);
        }
        if let Some(v) = file.economy_mode {
            self.economy_mode = v;
        }
        if let Some(v) = file.complexity_direct_threshold {
            self.complexity_direct_threshold = v;
        }
        if let Some(v) = file.max_context_turns {
            self.max_context_turns = Some(v);
        }
        if let Some(v) = file.oversight_probability {
            self.oversight_probability = v;
        }
        if let Some(v) = file.max_oversight_per_composite {
            self.max_oversight_per_composite = v;
        }
        if let Some(v) = file.oversight_thresholds {
            if let Some(count) = v.repeated_tool_count {
                self.oversight_thresholds.repeated_tool_count = count;
            }
            if let Some(seconds) = v.long_step_seconds {
                self.oversight_thresholds.long_step_seconds = seconds;
            }
        }
    }

    pub fn persistence_path(&self) -> PathBuf {
        self.persistence_path
            .clone()
            .unwrap_or_else(|| self.working_directory.join(".babylon"))
    }

    pub fn workflow_options(&self) -> WorkflowOptions {
        WorkflowOptions {
            max_depth: self.max_depth,
            max_retries: self.max_retries,
            max_composite_cycles: self.max_composite_cycles,
            complexity_direct_threshold: self.complexity_direct_threshold,
            economy_mode: self.economy_mode,
            cli_enabled: self.use_cli,
            max_context_turns: self.max_context_turns,
            simple_path_max_turns: self.simple_path_max_turns,
            oversight_probability: self.oversight_probability,
            max_oversight_per_composite: self.max_oversight_per_composite,
        }
    }
}

/// Shape of `.babylonrc.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub working_directory: Option<String>,
    pub persistence_path: Option<String>,
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    pub renderer: Option<String>,
    pub max_depth: Option<u32>,
    pub max_retries: Option<u32>,
    pub max_composite_cycles: Option<u32>,
    pub budget_dollars: Option<f64>,
    pub use_cli: Option<bool>,
    pub simple_path_max_turns: Option<u32>,
    pub verbose: Option<bool>,
    pub run_log_path: Option<String>,
    pub reviewer_model: Option<String>,
    pub economy_mode: Option<bool>,
    pub complexity_direct_threshold: Option<f64>,
    pub max_context_turns: Option<usize>,
    pub oversight_probability: Option<f64>,
    pub max_oversight_per_composite: Option<u32>,
    pub oversight_thresholds: Option<OversightThresholdsFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OversightThresholdsFile {
    pub repeated_tool_count: Option<usize>,
    pub long_step_seconds: Option<u64>,
}

/// Parse `.env` content: `KEY=VALUE` lines, a leading `export ` is
/// stripped, lines starting with `#` or blank lines are ignored.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}

/// Pick the working directory for a named run: `generations/<NN>-<name>/output`.
pub fn generation_dirs(base: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    let generations = base.join("generations");
    std::fs::create_dir_all(&generations)?;

    let mut next = 1u32;
    for entry in std::fs::read_dir(&generations)?.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some((number, _)) = file_name.split_once('-') {
            if let Ok(number) = number.parse::<u32>() {
                next = next.max(number + 1);
            }
        }
    }

    let generation = generations.join(format!("{next:02}-{name}"));
    let output = generation.join("output");
    std::fs::create_dir_all(&output)?;
    Ok((output, generation.join("run.txt")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_parsing() {
        let content = "\n# comment\nexport OPENAI_API_KEY=sk-test\nANTHROPIC_API_KEY=\"sk-ant\"\nbroken line\nFOO=bar\n";
        let vars = parse_env_file(content);
        assert_eq!(
            vars,
            vec![
                ("OPENAI_API_KEY".to_string(), "sk-test".to_string()),
                ("ANTHROPIC_API_KEY".to_string(), "sk-ant".to_string()),
                ("FOO".to_string(), "bar".to_string()),
            ]
        );
    }

    #[test]
    fn config_file_overrides_defaults() {
        let mut config = BabylonConfig::new(PathBuf::from("/w"));
        let file: ConfigFile = serde_json::from_str(
            r#"{
                "maxDepth": 3,
                "budgetDollars": 5.5,
                "useCli": false,
                "economyMode": true,
                "complexityDirectThreshold": 0.5,
                "oversightThresholds": {"repeatedToolCount": 4, "longStepSeconds": 120}
            }"#,
        )
        .unwrap();
        config.apply_file(file);

        assert_eq!(config.max_depth, 3);
        assert_eq!(config.budget_dollars, Some(5.5));
        assert!(!config.use_cli);
        assert!(config.economy_mode);
        assert_eq!(config.complexity_direct_threshold, 0.5);
        assert_eq!(config.oversight_thresholds.repeated_tool_count, 4);
        assert_eq!(config.oversight_thresholds.long_step_seconds, 120);
    }

    #[test]
    fn persistence_defaults_under_workdir() {
        let config = BabylonConfig::new(PathBuf::from("/w"));
        assert_eq!(config.persistence_path(), PathBuf::from("/w/.babylon"));
    }

    #[test]
    fn generation_numbering_increments() {
        let dir = tempfile::tempdir().unwrap();
        let (first_output, first_log) = generation_dirs(dir.path(), "alpha").unwrap();
        assert!(first_output.ends_with("generations/01-alpha/output"));
        assert!(first_log.ends_with("generations/01-alpha/run.txt"));

        let (second_output, _) = generation_dirs(dir.path(), "beta").unwrap();
        assert!(second_output.ends_with("generations/02-beta/output"));
    }
}
