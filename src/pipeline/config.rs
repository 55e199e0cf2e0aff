//! Engine and experiment configuration.
//!
//! Two layers:
//! - [`ExperimentDefinition`]: the experiment file (YAML or JSON) naming
//!   scenarios, frameworks, models and evaluators. Its contents are opaque
//!   to the engine beyond ids.
//! - [`EngineConfig`]: execution knobs (paths, batching, timeouts, retry and
//!   budget policy) with defaults, environment overrides and validation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::llm::ProviderRoute;
use crate::pipeline::artifacts::sanitize_component;
use crate::truncation::BudgetPolicy;
use crate::types::EvaluationStrategy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A filter named an id the experiment file does not define.
    #[error("Unknown {kind} id '{id}'")]
    UnknownId { kind: &'static str, id: String },

    /// The experiment file could not be decoded.
    #[error("Failed to parse experiment file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A scenario: an id plus opaque content handed to prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Ground-truth facts used when the context stage is bypassed.
    #[serde(default)]
    pub facts: serde_json::Value,
}

/// A named value framework applied during generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Framework {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Where the context stage gets its facts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Facts come from the scenario definition; no provider call.
    #[default]
    Config,
    /// Facts are established by a live call to `model`.
    Live { model: String },
}

/// Optional prompt template overrides. `{placeholder}` syntax.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// The experiment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub scenarios: Vec<Scenario>,
    pub frameworks: Vec<Framework>,
    pub models: Vec<String>,
    #[serde(default)]
    pub evaluator_models: Vec<String>,
    #[serde(default)]
    pub context_source: ContextSource,
    #[serde(default)]
    pub evaluation_strategy: EvaluationStrategy,
    #[serde(default)]
    pub prompts: PromptOverrides,
    /// Generation temperature; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ExperimentDefinition {
    /// Reads and validates an experiment file, returning it with the sha256
    /// of its bytes.
    ///
    /// `.json` files are decoded as JSON, everything else as YAML.
    pub fn load(path: &Path) -> Result<(Self, String), ConfigError> {
        let bytes = std::fs::read(path)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let text = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: format!("not valid UTF-8: {}", e),
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let definition: ExperimentDefinition = if is_json {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        definition.validate()?;
        Ok((definition, digest))
    }

    /// Checks for empty lists, duplicate ids and a usable context source.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one scenario is required".to_string(),
            ));
        }
        if self.frameworks.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one framework is required".to_string(),
            ));
        }
        if self.models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one model is required".to_string(),
            ));
        }
        if self.evaluator_models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one evaluator model is required".to_string(),
            ));
        }

        check_unique("scenario", self.scenarios.iter().map(|s| s.id.as_str()))?;
        check_unique("framework", self.frameworks.iter().map(|f| f.id.as_str()))?;
        check_unique("model", self.models.iter().map(String::as_str))?;
        check_unique("evaluator", self.evaluator_models.iter().map(String::as_str))?;
        check_distinct_file_names(&self.evaluator_models)?;

        if let ContextSource::Live { model } = &self.context_source {
            if model.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "live context source needs a model".to_string(),
                ));
            }
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationFailed(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Restricts the definition to the named ids. `None` keeps everything.
    pub fn filtered(
        &self,
        scenarios: Option<&[String]>,
        frameworks: Option<&[String]>,
        models: Option<&[String]>,
    ) -> Result<Self, ConfigError> {
        let mut out = self.clone();
        if let Some(ids) = scenarios {
            out.scenarios = select("scenario", &self.scenarios, ids, |s| &s.id)?;
        }
        if let Some(ids) = frameworks {
            out.frameworks = select("framework", &self.frameworks, ids, |f| &f.id)?;
        }
        if let Some(ids) = models {
            out.models = select("model", &self.models, ids, |m| m)?;
        }
        out.validate()?;
        Ok(out)
    }

    pub fn scenario(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    pub fn framework(&self, id: &str) -> Option<&Framework> {
        self.frameworks.iter().find(|f| f.id == id)
    }

    pub fn scenario_ids(&self) -> Vec<String> {
        self.scenarios.iter().map(|s| s.id.clone()).collect()
    }

    pub fn framework_ids(&self) -> Vec<String> {
        self.frameworks.iter().map(|f| f.id.clone()).collect()
    }

    /// Every model id any stage calls.
    pub fn all_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.models.clone();
        for m in &self.evaluator_models {
            if !models.contains(m) {
                models.push(m.clone());
            }
        }
        if let ContextSource::Live { model } = &self.context_source {
            if !models.contains(model) {
                models.push(model.clone());
            }
        }
        models
    }
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(format!("empty {} id", kind)));
        }
        if !seen.insert(id) {
            return Err(ConfigError::ValidationFailed(format!(
                "duplicate {} id '{}'",
                kind, id
            )));
        }
    }
    Ok(())
}

/// Evaluator ids name artifact files, so no two may sanitize to the same name.
fn check_distinct_file_names(evaluators: &[String]) -> Result<(), ConfigError> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for id in evaluators {
        let name = sanitize_component(id);
        if let Some(other) = seen.insert(name.clone(), id) {
            return Err(ConfigError::ValidationFailed(format!(
                "evaluators '{}' and '{}' share the artifact name '{}'",
                other, id, name
            )));
        }
    }
    Ok(())
}

fn select<T: Clone>(
    kind: &'static str,
    items: &[T],
    ids: &[String],
    id_of: impl Fn(&T) -> &String,
) -> Result<Vec<T>, ConfigError> {
    for id in ids {
        if !items.iter().any(|item| id_of(item) == id) {
            return Err(ConfigError::UnknownId {
                kind,
                id: id.clone(),
            });
        }
    }
    // Keep file order.
    Ok(items
        .iter()
        .filter(|item| ids.contains(id_of(item)))
        .cloned()
        .collect())
}

/// Execution settings read by the executor, scheduler and controller.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding every run and the run pointer.
    pub runs_dir: PathBuf,
    /// Maximum trials per model in one batch.
    pub batch_size_per_model: usize,
    /// Pause after each batch.
    pub inter_batch_delay: Duration,
    /// Worker-pool bound within a batch.
    pub max_concurrent_trials: usize,
    /// Hard timeout per provider call.
    pub call_timeout: Duration,
    /// Transport attempts per call before the stage fails.
    pub transport_max_attempts: u32,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
    /// Output-token budget escalation.
    pub budget: BudgetPolicy,
    pub context_temperature: f64,
    pub generation_temperature: f64,
    pub evaluation_temperature: f64,
    /// Send `response_format: json_object` with every call.
    pub structured_output: bool,
    /// Extra gateways, consulted before the default one.
    pub routes: Vec<ProviderRoute>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("./runs"),
            batch_size_per_model: 1,
            inter_batch_delay: Duration::from_secs(2),
            max_concurrent_trials: 8,
            call_timeout: Duration::from_secs(120),
            transport_max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            budget: BudgetPolicy::default(),
            context_temperature: 0.0,
            generation_temperature: 0.7,
            evaluation_temperature: 0.0,
            structured_output: true,
            routes: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TRIAL_FORGE_RUNS_DIR`: runs directory (default: ./runs)
    /// - `TRIAL_FORGE_BATCH_SIZE`: trials per model per batch (default: 1)
    /// - `TRIAL_FORGE_BATCH_DELAY_SECS`: inter-batch delay (default: 2)
    /// - `TRIAL_FORGE_MAX_CONCURRENT`: in-batch concurrency (default: 8)
    /// - `TRIAL_FORGE_CALL_TIMEOUT_SECS`: per-call timeout (default: 120)
    /// - `TRIAL_FORGE_ROUTES`: whitespace-separated `PATTERN=BASE_URL[,KEY_ENV]`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TRIAL_FORGE_RUNS_DIR") {
            config.runs_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TRIAL_FORGE_BATCH_SIZE") {
            config.batch_size_per_model = parse_env_value(&val, "TRIAL_FORGE_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("TRIAL_FORGE_BATCH_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TRIAL_FORGE_BATCH_DELAY_SECS")?;
            config.inter_batch_delay = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("TRIAL_FORGE_MAX_CONCURRENT") {
            config.max_concurrent_trials = parse_env_value(&val, "TRIAL_FORGE_MAX_CONCURRENT")?;
        }
        if let Ok(val) = std::env::var("TRIAL_FORGE_CALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TRIAL_FORGE_CALL_TIMEOUT_SECS")?;
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("TRIAL_FORGE_ROUTES") {
            config.routes = parse_routes(&val, "TRIAL_FORGE_ROUTES")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size_per_model == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size_per_model must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_trials == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_trials must be greater than 0".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "call_timeout must be greater than 0".to_string(),
            ));
        }
        if self.transport_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "transport_max_attempts must be at least 1".to_string(),
            ));
        }
        self.budget.validate().map_err(ConfigError::ValidationFailed)?;
        for (name, t) in [
            ("context_temperature", self.context_temperature),
            ("generation_temperature", self.generation_temperature),
            ("evaluation_temperature", self.evaluation_temperature),
        ] {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be between 0.0 and 2.0",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = dir.into();
        self
    }

    pub fn with_batch_size_per_model(mut self, size: usize) -> Self {
        self.batch_size_per_model = size;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_max_concurrent_trials(mut self, max: usize) -> Self {
        self.max_concurrent_trials = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_transport_max_attempts(mut self, attempts: u32) -> Self {
        self.transport_max_attempts = attempts;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_budget(mut self, budget: BudgetPolicy) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_generation_temperature(mut self, temperature: f64) -> Self {
        self.generation_temperature = temperature;
        self
    }

    pub fn with_route(mut self, route: ProviderRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_structured_output(mut self, enabled: bool) -> Self {
        self.structured_output = enabled;
        self
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses whitespace-separated provider routes.
pub fn parse_routes(value: &str, key: &str) -> Result<Vec<ProviderRoute>, ConfigError> {
    value
        .split_whitespace()
        .map(|route| parse_env_value(route, key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXPERIMENT_YAML: &str = r#"
scenarios:
  - id: layoffs
    description: A company must announce layoffs.
    facts:
      headcount: 120
  - id: recall
    description: A product recall.
frameworks:
  - id: utilitarian
    description: Maximize aggregate welfare.
  - id: deontological
models: [vendor-a/model-1, vendor-b/model-2]
evaluator_models: [vendor-c/judge]
context_source: config
evaluation_strategy: dimensional
"#;

    fn definition() -> ExperimentDefinition {
        serde_yaml::from_str(EXPERIMENT_YAML).expect("yaml")
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size_per_model, 1);
        assert_eq!(config.inter_batch_delay, Duration::from_secs(2));
        assert_eq!(config.budget.initial, 2048);
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let config = EngineConfig::default().with_batch_size_per_model(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_parse_env_value_error_names_key() {
        let err = parse_env_value::<usize>("many", "TRIAL_FORGE_BATCH_SIZE").expect_err("bad");
        assert!(err.to_string().contains("TRIAL_FORGE_BATCH_SIZE"));
    }

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(
            " local/=http://127.0.0.1:8080/v1\n  judge-1=https://judge.test/v1,JUDGE_KEY ",
            "TRIAL_FORGE_ROUTES",
        )
        .expect("routes");
        assert_eq!(routes.len(), 2);
        assert!(routes[0].is_prefix());
        assert_eq!(routes[1].api_key_env.as_deref(), Some("JUDGE_KEY"));

        let err = parse_routes("broken", "TRIAL_FORGE_ROUTES").expect_err("bad route");
        assert!(err.to_string().contains("TRIAL_FORGE_ROUTES"));
        assert!(parse_routes("", "TRIAL_FORGE_ROUTES").expect("empty").is_empty());
    }

    #[test]
    fn test_load_yaml_with_digest() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("experiment.yaml");
        std::fs::write(&path, EXPERIMENT_YAML).expect("write");

        let (def, digest) = ExperimentDefinition::load(&path).expect("load");
        assert_eq!(def.scenarios.len(), 2);
        assert_eq!(def.evaluation_strategy, EvaluationStrategy::Dimensional);
        assert_eq!(def.context_source, ContextSource::Config);
        assert_eq!(def.scenarios[0].facts["headcount"], 120);
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn test_load_json_live_context() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("experiment.json");
        let mut value = serde_json::to_value(definition()).expect("to json");
        value["context_source"] = serde_json::json!({"live": {"model": "vendor-a/model-1"}});
        std::fs::write(&path, value.to_string()).expect("write");

        let (def, _) = ExperimentDefinition::load(&path).expect("load");
        assert_eq!(
            def.context_source,
            ContextSource::Live {
                model: "vendor-a/model-1".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut def = definition();
        def.models.push("vendor-a/model-1".to_string());
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_evaluators_sharing_a_file_name_rejected() {
        let mut def = definition();
        def.evaluator_models = vec!["vendor/judge".to_string(), "vendor_judge".to_string()];
        let err = def.validate().expect_err("collision");
        assert!(err.to_string().contains("vendor_judge"));

        def.evaluator_models = vec!["vendor/judge".to_string(), "vendor/judge-2".to_string()];
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_invalid_utf8() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("experiment.yaml");
        let mut bytes = EXPERIMENT_YAML.as_bytes().to_vec();
        bytes.extend_from_slice(b"# \xff\xfe\n");
        std::fs::write(&path, bytes).expect("write");

        let err = ExperimentDefinition::load(&path).expect_err("invalid utf-8");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_filters_keep_file_order_and_reject_unknown() {
        let def = definition();
        let filtered = def
            .filtered(
                Some(&["recall".to_string(), "layoffs".to_string()]),
                None,
                Some(&["vendor-b/model-2".to_string()]),
            )
            .expect("filter");
        assert_eq!(filtered.scenario_ids(), vec!["layoffs", "recall"]);
        assert_eq!(filtered.models, vec!["vendor-b/model-2"]);

        let err = def
            .filtered(None, Some(&["stoic".to_string()]), None)
            .expect_err("unknown");
        assert!(matches!(err, ConfigError::UnknownId { kind: "framework", .. }));
    }

    #[test]
    fn test_all_models_deduplicates() {
        let mut def = definition();
        def.context_source = ContextSource::Live {
            model: "vendor-a/model-1".to_string(),
        };
        assert_eq!(
            def.all_models(),
            vec!["vendor-a/model-1", "vendor-b/model-2", "vendor-c/judge"]
        );
    }
}
