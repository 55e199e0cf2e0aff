//! Layer pipeline executor.
//!
//! Runs one trial through the three stages in order:
//!
//! 1. **Context**: establish scenario facts, either from the experiment file
//!    (bypass, no provider call) or by a live call.
//! 2. **Generation**: the trial's model reasons about the scenario under the
//!    trial's framework.
//! 3. **Evaluation**: every configured evaluator scores the generation.
//!
//! Each provider call site combines two independent retry loops. The outer
//! loop escalates the output-token budget while responses come back
//! truncated; the inner loop retries retryable transport errors with
//! exponential backoff. Every attempt's raw text is written to disk before it
//! is parsed, and the parsed artifact is written only after its raw file.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::artifacts::{
    ArtifactKey, ArtifactWriter, AuditLog, AuditRecord, LayerArtifact, StorageError,
    BYPASS_SENTINEL,
};
use super::config::{ContextSource, EngineConfig, ExperimentDefinition, Framework, Scenario};
use super::prompts::{self, render};
use crate::error::{LlmError, ProviderErrorKind, StageError, StageFailureReason};
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, Message};
use crate::parser::{parse_response, ExpectedShape, ParseResult};
use crate::state::{LayerSummary, TrialIdentity, TrialStatus};
use crate::truncation::{detect, RetryState, TruncationRetry};
use crate::types::{EvaluationStrategy, ParseStatus, Stage};

/// Errors that stop a trial without being attributable to a stage.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Artifact or audit-log storage failed; the trial must stay resumable.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The trial names a scenario or framework the definition lacks.
    #[error("Trial {trial_id} references unknown {kind} '{id}'")]
    UnknownReference {
        trial_id: String,
        kind: &'static str,
        id: String,
    },
}

/// Result of running one trial to a terminal status.
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub trial_id: String,
    /// `Completed` or `Failed`.
    pub status: TrialStatus,
    /// Per-layer summary keyed by layer name (`context`, `generation`,
    /// `evaluation:<model>`).
    pub layers: BTreeMap<String, LayerSummary>,
    pub failure: Option<StageError>,
}

impl TrialOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == TrialStatus::Completed
    }
}

/// A parsed attempt that may still be kept if escalation goes no further.
struct Candidate {
    parsed: ParseResult,
    raw: String,
    budget: u32,
}

/// Result of one accepted call site.
#[derive(Debug, Clone)]
struct CallSiteOutput {
    parsed: ParseResult,
    raw: String,
    summary: LayerSummary,
}

enum CallSiteError {
    Failed(StageFailureReason),
    Storage(StorageError),
}

impl From<StorageError> for CallSiteError {
    fn from(err: StorageError) -> Self {
        CallSiteError::Storage(err)
    }
}

/// Everything a call site needs besides the provider.
struct CallSite<'a> {
    key: ArtifactKey,
    model: &'a str,
    messages: Vec<Message>,
    temperature: f64,
    shape: ExpectedShape,
}

/// Executes trials against one run directory.
///
/// Holds no per-trial state, so many trials can run through one executor
/// concurrently.
pub struct PipelineExecutor {
    provider: Arc<dyn LlmProvider>,
    config: EngineConfig,
    definition: Arc<ExperimentDefinition>,
    evaluators: Vec<String>,
    strategy: EvaluationStrategy,
    artifacts: ArtifactWriter,
    audit: AuditLog,
}

impl PipelineExecutor {
    /// Creates an executor writing under `run_dir`. Evaluators and strategy
    /// default to the definition's.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        config: EngineConfig,
        definition: Arc<ExperimentDefinition>,
        run_dir: &std::path::Path,
    ) -> Self {
        let evaluators = definition.evaluator_models.clone();
        let strategy = definition.evaluation_strategy;
        Self {
            provider,
            config,
            definition,
            evaluators,
            strategy,
            artifacts: ArtifactWriter::new(run_dir),
            audit: AuditLog::new(run_dir),
        }
    }

    pub fn with_evaluators(mut self, evaluators: Vec<String>) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn with_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn artifacts(&self) -> &ArtifactWriter {
        &self.artifacts
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Runs all stages for `identity`.
    ///
    /// Stage failures produce a `Failed` outcome; only storage problems and
    /// dangling references are errors.
    pub async fn run_trial(&self, identity: &TrialIdentity) -> Result<TrialOutcome, ExecutorError> {
        let started = Instant::now();
        let scenario = self
            .definition
            .scenario(&identity.scenario_id)
            .ok_or_else(|| ExecutorError::UnknownReference {
                trial_id: identity.trial_id.clone(),
                kind: "scenario",
                id: identity.scenario_id.clone(),
            })?;
        let framework = self
            .definition
            .framework(&identity.framework_id)
            .ok_or_else(|| ExecutorError::UnknownReference {
                trial_id: identity.trial_id.clone(),
                kind: "framework",
                id: identity.framework_id.clone(),
            })?;

        info!(
            trial_id = %identity.trial_id,
            scenario = %identity.scenario_id,
            framework = %identity.framework_id,
            model = %identity.model_id,
            "Starting trial"
        );

        let mut layers = BTreeMap::new();
        let failure = match self
            .run_stages(identity, scenario, framework, &mut layers)
            .await
        {
            Ok(()) => None,
            Err(CallSiteErrorWithStage::Storage(err)) => return Err(ExecutorError::Storage(err)),
            Err(CallSiteErrorWithStage::Failed(err)) => Some(err),
        };

        let status = if failure.is_some() {
            TrialStatus::Failed
        } else {
            TrialStatus::Completed
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        match &failure {
            None => info!(trial_id = %identity.trial_id, latency_ms, "Trial completed"),
            Some(err) => warn!(trial_id = %identity.trial_id, latency_ms, error = %err, "Trial failed"),
        }

        Ok(TrialOutcome {
            trial_id: identity.trial_id.clone(),
            status,
            layers,
            failure,
        })
    }

    async fn run_stages(
        &self,
        identity: &TrialIdentity,
        scenario: &Scenario,
        framework: &Framework,
        layers: &mut BTreeMap<String, LayerSummary>,
    ) -> Result<(), CallSiteErrorWithStage> {
        let trial_id = identity.trial_id.as_str();

        // Stage A
        let facts = self.run_context(trial_id, scenario, layers).await?;

        // Stage B
        let facts_text = serde_json::to_string_pretty(&facts).unwrap_or_else(|_| facts.to_string());
        let prompt = render(
            self.definition
                .prompts
                .generation
                .as_deref()
                .unwrap_or(prompts::GENERATION_TEMPLATE),
            &[
                ("scenario", scenario.description.as_str()),
                ("facts", facts_text.as_str()),
                ("framework_id", framework.id.as_str()),
                ("framework", framework.description.as_str()),
            ],
        );
        let generation = self
            .run_site(
                trial_id,
                CallSite {
                    key: ArtifactKey::new(Stage::Generation, trial_id),
                    model: &identity.model_id,
                    messages: self.messages(prompt),
                    temperature: self
                        .definition
                        .temperature
                        .unwrap_or(self.config.generation_temperature),
                    shape: ExpectedShape::for_stage(Stage::Generation),
                },
                layers,
            )
            .await?;

        // Stage C
        let response_text = match generation.parsed.structured() {
            Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
            None => generation.raw.clone(),
        };
        let template = self
            .definition
            .prompts
            .evaluation
            .as_deref()
            .unwrap_or(prompts::EVALUATION_TEMPLATE);
        let prompt = render(
            template,
            &[
                ("scenario", scenario.description.as_str()),
                ("framework_id", framework.id.as_str()),
                ("framework", framework.description.as_str()),
                ("response", response_text.as_str()),
                ("rubric", prompts::rubric(self.strategy)),
            ],
        );

        // Evaluators are independent: run them all, then report the first failure.
        let mut first_failure = None;
        for evaluator in &self.evaluators {
            let site = CallSite {
                key: ArtifactKey::evaluation(trial_id, evaluator.as_str()),
                model: evaluator,
                messages: self.messages(prompt.clone()),
                temperature: self.config.evaluation_temperature,
                shape: ExpectedShape::for_stage(Stage::Evaluation),
            };
            match self.run_site(trial_id, site, layers).await {
                Ok(_) => {}
                Err(CallSiteErrorWithStage::Failed(err)) => {
                    first_failure.get_or_insert(err);
                }
                Err(storage) => return Err(storage),
            }
        }
        match first_failure {
            Some(err) => Err(CallSiteErrorWithStage::Failed(err)),
            None => Ok(()),
        }
    }

    /// Stage A. Returns the facts handed to generation.
    async fn run_context(
        &self,
        trial_id: &str,
        scenario: &Scenario,
        layers: &mut BTreeMap<String, LayerSummary>,
    ) -> Result<Value, CallSiteErrorWithStage> {
        let key = ArtifactKey::new(Stage::Context, trial_id);
        match &self.definition.context_source {
            ContextSource::Config => {
                let facts = if scenario.facts.is_null() {
                    json!(scenario.description)
                } else {
                    scenario.facts.clone()
                };
                let sequence = self
                    .artifacts
                    .next_raw_sequence(&key)
                    .await
                    .map_err(CallSiteErrorWithStage::Storage)?;
                self.artifacts
                    .write_raw(&key, sequence, BYPASS_SENTINEL)
                    .await
                    .map_err(CallSiteErrorWithStage::Storage)?;
                let artifact = LayerArtifact {
                    trial_id: trial_id.to_string(),
                    stage: Stage::Context,
                    model: String::new(),
                    raw_response: BYPASS_SENTINEL.to_string(),
                    parsed_result: Some(json!({ "facts": facts })),
                    parse_status: ParseStatus::Success,
                    tokens_budget_used: 0,
                    attempts: 1,
                    raw_files: vec![ArtifactWriter::raw_file_name(&key, sequence)],
                    bypassed: true,
                    budget_exhausted: false,
                    written_at: Utc::now(),
                };
                self.artifacts
                    .write_parsed(&key, &artifact)
                    .await
                    .map_err(CallSiteErrorWithStage::Storage)?;
                layers.insert(
                    key.layer_name(),
                    LayerSummary {
                        parse_status: ParseStatus::Success,
                        tokens_budget_used: 0,
                        attempts: 1,
                    },
                );
                debug!(trial_id, stage = %Stage::Context, "Context bypassed");
                Ok(facts)
            }
            ContextSource::Live { model } => {
                let prompt = render(
                    self.definition
                        .prompts
                        .context
                        .as_deref()
                        .unwrap_or(prompts::CONTEXT_TEMPLATE),
                    &[
                        ("scenario_id", scenario.id.as_str()),
                        ("scenario", scenario.description.as_str()),
                    ],
                );
                let output = self
                    .run_site(
                        trial_id,
                        CallSite {
                            key,
                            model,
                            messages: self.messages(prompt),
                            temperature: self.config.context_temperature,
                            shape: ExpectedShape::for_stage(Stage::Context),
                        },
                        layers,
                    )
                    .await?;
                Ok(match output.parsed.structured() {
                    Some(value) => value.get("facts").cloned().unwrap_or_else(|| value.clone()),
                    None => Value::String(output.raw),
                })
            }
        }
    }

    fn messages(&self, prompt: String) -> Vec<Message> {
        let system = self
            .definition
            .prompts
            .system
            .as_deref()
            .unwrap_or(prompts::DEFAULT_SYSTEM_PROMPT);
        vec![Message::system(system), Message::user(prompt)]
    }

    /// Runs a call site and records its layer summary, attributing failures
    /// to the site's stage and model.
    async fn run_site(
        &self,
        trial_id: &str,
        site: CallSite<'_>,
        layers: &mut BTreeMap<String, LayerSummary>,
    ) -> Result<CallSiteOutput, CallSiteErrorWithStage> {
        let stage = site.key.stage;
        let model = site.model.to_string();
        let layer = site.key.layer_name();
        match self.call_with_escalation(trial_id, site).await {
            Ok(output) => {
                layers.insert(layer, output.summary.clone());
                Ok(output)
            }
            Err(CallSiteError::Failed(reason)) => Err(CallSiteErrorWithStage::Failed(StageError {
                stage,
                model,
                reason,
            })),
            Err(CallSiteError::Storage(err)) => Err(CallSiteErrorWithStage::Storage(err)),
        }
    }

    /// Outer loop: escalate the budget while the output is truncated.
    ///
    /// A truncated attempt that still parsed is remembered; if a later,
    /// larger attempt fails outright it is kept instead of failing the stage.
    async fn call_with_escalation(
        &self,
        trial_id: &str,
        site: CallSite<'_>,
    ) -> Result<CallSiteOutput, CallSiteError> {
        let mut retry = TruncationRetry::new(self.config.budget);
        let first_sequence = self.artifacts.next_raw_sequence(&site.key).await?;
        let mut raw_files = Vec::new();
        let mut best: Option<Candidate> = None;
        let mut attempt: u32 = 0;

        loop {
            let budget = retry.budget();
            let escalation = retry.state().escalation();
            attempt += 1;

            let mut request = GenerationRequest::new(site.model, site.messages.clone())
                .with_temperature(site.temperature)
                .with_max_tokens(budget);
            if self.config.structured_output {
                request = request.with_json_output();
            }

            let response = match self
                .call_with_backoff(trial_id, &site, request, budget, escalation)
                .await
            {
                Ok(response) => response,
                Err(CallSiteError::Failed(reason)) => match best.take() {
                    Some(candidate) => {
                        warn!(
                            trial_id,
                            stage = %site.key.stage,
                            model = site.model,
                            budget,
                            kept_budget = candidate.budget,
                            error = %reason,
                            "Escalated call failed, keeping earlier truncated output"
                        );
                        return self
                            .accept(trial_id, &site, candidate, attempt, raw_files, true)
                            .await;
                    }
                    None => return Err(CallSiteError::Failed(reason)),
                },
                Err(err) => return Err(err),
            };
            let raw = response.first_content().unwrap_or_default().to_string();

            // Raw text reaches disk before anything interprets it.
            let sequence = first_sequence + attempt - 1;
            self.artifacts.write_raw(&site.key, sequence, &raw).await?;
            raw_files.push(ArtifactWriter::raw_file_name(&site.key, sequence));

            let parsed = parse_response(&raw, &site.shape);
            let verdict = detect(&raw, parsed.status.is_usable(), response.finish_reason());
            let current = Candidate {
                parsed,
                raw,
                budget,
            };

            match retry.observe(verdict.truncated) {
                RetryState::Attempting { budget: next, .. } | RetryState::Truncated { budget: next, .. } => {
                    warn!(
                        trial_id,
                        stage = %site.key.stage,
                        model = site.model,
                        budget,
                        next_budget = next,
                        reason = ?verdict.reason,
                        "Truncated response, escalating budget"
                    );
                    if current.parsed.status.is_usable() {
                        best = Some(current);
                    }
                }
                RetryState::Accepted { .. } => {
                    return self
                        .accept(trial_id, &site, current, attempt, raw_files, false)
                        .await;
                }
                RetryState::Exhausted { .. } => {
                    let kept = match best.take() {
                        Some(candidate) if !current.parsed.status.is_usable() => candidate,
                        _ => current,
                    };
                    if !kept.parsed.status.is_usable() {
                        let artifact = layer_artifact(trial_id, &site, &kept, attempt, raw_files, true);
                        self.artifacts.write_parsed(&site.key, &artifact).await?;
                        warn!(
                            trial_id,
                            stage = %site.key.stage,
                            model = site.model,
                            budget,
                            "Output still truncated at budget ceiling"
                        );
                        return Err(CallSiteError::Failed(
                            StageFailureReason::TruncationExhausted {
                                budget,
                                escalations: escalation,
                            },
                        ));
                    }
                    warn!(
                        trial_id,
                        stage = %site.key.stage,
                        model = site.model,
                        budget,
                        parse_status = %kept.parsed.status,
                        "Budget exhausted, keeping best available output"
                    );
                    return self
                        .accept(trial_id, &site, kept, attempt, raw_files, true)
                        .await;
                }
            }
        }
    }

    /// Writes the parsed artifact for the kept attempt.
    async fn accept(
        &self,
        trial_id: &str,
        site: &CallSite<'_>,
        kept: Candidate,
        attempts: u32,
        raw_files: Vec<String>,
        budget_exhausted: bool,
    ) -> Result<CallSiteOutput, CallSiteError> {
        let artifact = layer_artifact(trial_id, site, &kept, attempts, raw_files, budget_exhausted);
        self.artifacts.write_parsed(&site.key, &artifact).await?;
        debug!(
            trial_id,
            stage = %site.key.stage,
            model = site.model,
            budget = kept.budget,
            attempts,
            parse_status = %kept.parsed.status,
            "Layer accepted"
        );
        Ok(CallSiteOutput {
            summary: LayerSummary {
                parse_status: kept.parsed.status,
                tokens_budget_used: kept.budget,
                attempts,
            },
            parsed: kept.parsed,
            raw: kept.raw,
        })
    }

    /// Inner loop: one budget, retrying retryable transport errors.
    async fn call_with_backoff(
        &self,
        trial_id: &str,
        site: &CallSite<'_>,
        request: GenerationRequest,
        budget: u32,
        escalation: u32,
    ) -> Result<GenerationResponse, CallSiteError> {
        let max_attempts = self.config.transport_max_attempts.max(1);
        let mut last: Option<(ProviderErrorKind, String)> = None;

        for transport_attempt in 1..=max_attempts {
            if let Some((kind, _)) = &last {
                let delay = self.backoff_delay(transport_attempt - 1, *kind);
                debug!(trial_id, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.provider.generate(request.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout {
                    seconds: self.config.call_timeout.as_secs(),
                }),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let mut record = AuditRecord {
                at: Utc::now(),
                trial_id: trial_id.to_string(),
                stage: site.key.stage,
                model: site.model.to_string(),
                budget,
                escalation,
                transport_attempt,
                latency_ms,
                ok: result.is_ok(),
                error_kind: None,
                error: None,
                finish_reason: None,
                completion_tokens: None,
            };

            match result {
                Ok(response) => {
                    record.finish_reason = response.finish_reason().map(str::to_string);
                    record.completion_tokens = Some(response.usage.completion_tokens);
                    self.audit.append(&record).await?;
                    debug!(
                        trial_id,
                        stage = %site.key.stage,
                        model = site.model,
                        budget,
                        attempt = transport_attempt,
                        latency_ms,
                        "Provider call succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    let kind = err.kind();
                    record.error_kind = Some(kind);
                    record.error = Some(err.to_string());
                    self.audit.append(&record).await?;

                    if !kind.is_retryable() {
                        warn!(
                            trial_id,
                            stage = %site.key.stage,
                            model = site.model,
                            error = %err,
                            "Permanent provider error"
                        );
                        return Err(CallSiteError::Failed(
                            StageFailureReason::PermanentProvider {
                                message: err.to_string(),
                            },
                        ));
                    }
                    warn!(
                        trial_id,
                        stage = %site.key.stage,
                        model = site.model,
                        attempt = transport_attempt,
                        max_attempts,
                        error_kind = %kind,
                        error = %err,
                        "Provider call failed"
                    );
                    last = Some((kind, err.to_string()));
                }
            }
        }

        let (error_kind, last_error) =
            last.unwrap_or((ProviderErrorKind::Transient, "no attempt made".to_string()));
        Err(CallSiteError::Failed(StageFailureReason::TransportExhausted {
            error_kind,
            attempts: max_attempts,
            last_error,
        }))
    }

    /// `backoff_base * 2^(retry-1)`, doubled again when rate limited.
    fn backoff_delay(&self, retry: u32, kind: ProviderErrorKind) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self.config.backoff_base.saturating_mul(1u32 << exponent);
        if kind == ProviderErrorKind::RateLimited {
            delay.saturating_mul(2)
        } else {
            delay
        }
    }
}

fn layer_artifact(
    trial_id: &str,
    site: &CallSite<'_>,
    kept: &Candidate,
    attempts: u32,
    raw_files: Vec<String>,
    budget_exhausted: bool,
) -> LayerArtifact {
    LayerArtifact {
        trial_id: trial_id.to_string(),
        stage: site.key.stage,
        model: site.model.to_string(),
        raw_response: kept.raw.clone(),
        parsed_result: Some(kept.parsed.to_value()),
        parse_status: kept.parsed.status,
        tokens_budget_used: kept.budget,
        attempts,
        raw_files,
        bypassed: false,
        budget_exhausted,
        written_at: Utc::now(),
    }
}

/// Call-site error once attributed to a stage.
enum CallSiteErrorWithStage {
    Failed(StageError),
    Storage(StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::{PromptOverrides, Scenario};
    use crate::truncation::BudgetPolicy;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    type Scripted = Result<GenerationResponse, LlmError>;

    /// Replays scripted responses per model; falls back to a fixed answer.
    #[derive(Default)]
    struct ScriptedProvider {
        scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
        budgets: Mutex<Vec<(String, Option<u32>)>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn script(self, model: &str, responses: Vec<Scripted>) -> Self {
            self.scripts
                .lock()
                .expect("lock")
                .insert(model.to_string(), responses.into());
            self
        }

        fn budgets_for(&self, model: &str) -> Vec<Option<u32>> {
            self.budgets
                .lock()
                .expect("lock")
                .iter()
                .filter(|(m, _)| m == model)
                .map(|(_, b)| *b)
                .collect()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.budgets
                .lock()
                .expect("lock")
                .push((request.model.clone(), request.max_tokens));
            let next = self
                .scripts
                .lock()
                .expect("lock")
                .get_mut(&request.model)
                .and_then(|q| q.pop_front());
            match next {
                Some(scripted) => scripted,
                None => Ok(GenerationResponse::from_text(
                    request.model,
                    r#"{"decision": "act", "reasoning": "because", "score": 70}"#,
                )),
            }
        }
    }

    fn definition() -> ExperimentDefinition {
        ExperimentDefinition {
            scenarios: vec![Scenario {
                id: "s1".to_string(),
                description: "A trolley problem".to_string(),
                facts: json!(["five people on the track"]),
            }],
            frameworks: vec![Framework {
                id: "util".to_string(),
                description: "Maximize welfare".to_string(),
            }],
            models: vec!["gen/a".to_string()],
            evaluator_models: vec!["eval/x".to_string()],
            context_source: ContextSource::Config,
            evaluation_strategy: EvaluationStrategy::Holistic,
            prompts: PromptOverrides::default(),
            temperature: None,
        }
    }

    fn identity() -> TrialIdentity {
        TrialIdentity {
            trial_id: "trial_001".to_string(),
            scenario_id: "s1".to_string(),
            framework_id: "util".to_string(),
            model_id: "gen/a".to_string(),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_backoff_base(Duration::from_millis(1))
            .with_call_timeout(Duration::from_secs(5))
    }

    fn executor(provider: Arc<ScriptedProvider>, run_dir: &std::path::Path) -> PipelineExecutor {
        PipelineExecutor::new(provider, config(), Arc::new(definition()), run_dir)
    }

    #[tokio::test]
    async fn test_happy_path_writes_all_layers() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default());
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.layers.keys().cloned().collect::<Vec<_>>(),
            vec!["context", "evaluation:eval/x", "generation"]
        );
        // Context is bypassed: only generation and one evaluator hit the provider.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let context = exec
            .artifacts()
            .read_parsed(&ArtifactKey::new(Stage::Context, "trial_001"))
            .await
            .expect("read")
            .expect("context artifact");
        assert!(context.bypassed);
        assert_eq!(context.raw_response, BYPASS_SENTINEL);

        let generation = exec
            .artifacts()
            .read_parsed(&ArtifactKey::new(Stage::Generation, "trial_001"))
            .await
            .expect("read")
            .expect("generation artifact");
        assert_eq!(generation.parse_status, ParseStatus::Success);
        assert_eq!(generation.tokens_budget_used, 2048);
        assert!(exec
            .artifacts()
            .raw_path(&ArtifactKey::new(Stage::Generation, "trial_001"), 1)
            .exists());

        let audit = exec.audit_log().read_all().await.expect("audit");
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|r| r.ok));
    }

    #[tokio::test]
    async fn test_truncation_escalates_budget_and_keeps_every_raw() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![
                Ok(GenerationResponse::from_text("gen/a", r#"{"decision": "act", "reas"#)),
                Ok(GenerationResponse::from_text(
                    "gen/a",
                    r#"{"decision": "act", "reasoning": "full"}"#,
                )),
            ],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        let layer = &outcome.layers["generation"];
        assert_eq!(layer.tokens_budget_used, 4096);
        assert_eq!(layer.attempts, 2);
        assert_eq!(provider.budgets_for("gen/a"), vec![Some(2048), Some(4096)]);

        let key = ArtifactKey::new(Stage::Generation, "trial_001");
        assert!(exec.artifacts().raw_path(&key, 1).exists());
        assert!(exec.artifacts().raw_path(&key, 2).exists());
        let artifact = exec
            .artifacts()
            .read_parsed(&key)
            .await
            .expect("read")
            .expect("artifact");
        assert_eq!(artifact.raw_files.len(), 2);
        assert!(!artifact.budget_exhausted);
    }

    #[tokio::test]
    async fn test_empty_output_at_length_limit_escalates() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![
                Ok(GenerationResponse::from_text("gen/a", "").with_finish_reason("length")),
                Ok(GenerationResponse::from_text(
                    "gen/a",
                    r#"{"decision": "act", "reasoning": "full"}"#,
                )),
            ],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        let layer = &outcome.layers["generation"];
        assert_eq!(layer.parse_status, ParseStatus::Success);
        assert_eq!(layer.tokens_budget_used, 4096);
        assert_eq!(provider.budgets_for("gen/a"), vec![Some(2048), Some(4096)]);
    }

    #[tokio::test]
    async fn test_failed_escalation_keeps_earlier_usable_output() {
        let dir = tempdir().expect("tempdir");
        let down = || {
            Err(LlmError::ApiError {
                code: 502,
                message: "bad gateway".to_string(),
            })
        };
        // First object is complete, a trailing one was cut mid-string.
        let cut = r#"{"decision": "act", "reasoning": "ok"} {"note": "trail"#;
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![
                Ok(GenerationResponse::from_text("gen/a", cut)),
                down(),
                down(),
                down(),
            ],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed(), "failure: {:?}", outcome.failure);
        let layer = &outcome.layers["generation"];
        assert_eq!(layer.tokens_budget_used, 2048);
        assert!(layer.parse_status.is_usable());

        let artifact = exec
            .artifacts()
            .read_parsed(&ArtifactKey::new(Stage::Generation, "trial_001"))
            .await
            .expect("read")
            .expect("artifact");
        assert!(artifact.budget_exhausted);
        assert_eq!(artifact.raw_response, cut);
        assert_eq!(artifact.raw_files, vec!["trial_001.raw.1.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_rerun_keeps_earlier_raw_output() {
        let dir = tempdir().expect("tempdir");
        let first = r#"{"decision": "act", "reasoning": "first execution"}"#;
        let second = r#"{"decision": "wait", "reasoning": "second execution"}"#;
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![
                Ok(GenerationResponse::from_text("gen/a", first)),
                Ok(GenerationResponse::from_text("gen/a", second)),
            ],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        exec.run_trial(&identity()).await.expect("first run");
        exec.run_trial(&identity()).await.expect("second run");

        let key = ArtifactKey::new(Stage::Generation, "trial_001");
        let raw_1 = std::fs::read_to_string(exec.artifacts().raw_path(&key, 1)).expect("raw 1");
        let raw_2 = std::fs::read_to_string(exec.artifacts().raw_path(&key, 2)).expect("raw 2");
        assert_eq!(raw_1, first);
        assert_eq!(raw_2, second);

        let artifact = exec
            .artifacts()
            .read_parsed(&key)
            .await
            .expect("read")
            .expect("artifact");
        assert_eq!(artifact.raw_files, vec!["trial_001.raw.2.txt".to_string()]);
        assert_eq!(artifact.raw_response, second);

        let context = ArtifactKey::new(Stage::Context, "trial_001");
        assert!(exec.artifacts().raw_path(&context, 2).exists());
    }

    #[tokio::test]
    async fn test_truncation_exhausted_fails_trial() {
        let dir = tempdir().expect("tempdir");
        let cut = || Ok(GenerationResponse::from_text("gen/a", r#"{"decision": "ac"#));
        let provider = Arc::new(
            ScriptedProvider::default().script("gen/a", vec![cut(), cut(), cut(), cut()]),
        );
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert_eq!(outcome.status, TrialStatus::Failed);
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Generation);
        assert_eq!(
            failure.reason,
            StageFailureReason::TruncationExhausted {
                budget: 16384,
                escalations: 3
            }
        );
        assert_eq!(
            provider.budgets_for("gen/a"),
            BudgetPolicy::default().schedule().into_iter().map(Some).collect::<Vec<_>>()
        );
        // Evaluation never ran.
        assert!(!outcome.layers.contains_key("evaluation:eval/x"));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![
                Err(LlmError::ApiError {
                    code: 503,
                    message: "overloaded".to_string(),
                }),
                Err(LlmError::RateLimited("slow down".to_string())),
            ],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        // A transport retry is not a budget escalation.
        assert_eq!(outcome.layers["generation"].attempts, 1);
        assert_eq!(
            provider.budgets_for("gen/a"),
            vec![Some(2048), Some(2048), Some(2048)]
        );

        let audit = exec.audit_log().read_all().await.expect("audit");
        let failed: Vec<_> = audit.iter().filter(|r| !r.ok).collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[1].error_kind, Some(ProviderErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn test_transport_exhaustion_fails_stage() {
        let dir = tempdir().expect("tempdir");
        let down = || {
            Err(LlmError::ApiError {
                code: 502,
                message: "bad gateway".to_string(),
            })
        };
        let provider = Arc::new(
            ScriptedProvider::default().script("eval/x", vec![down(), down(), down()]),
        );
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert_eq!(outcome.status, TrialStatus::Failed);
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Evaluation);
        assert_eq!(failure.model, "eval/x");
        assert!(matches!(
            failure.reason,
            StageFailureReason::TransportExhausted { attempts: 3, .. }
        ));
        // Generation output survives the evaluation failure.
        assert!(outcome.layers.contains_key("generation"));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default().script(
            "gen/a",
            vec![Err(LlmError::InvalidModel("gen/a".to_string()))],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert_eq!(outcome.status, TrialStatus::Failed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome.failure.expect("failure").reason,
            StageFailureReason::PermanentProvider { .. }
        ));
    }

    #[tokio::test]
    async fn test_unparseable_complete_output_needs_review_but_completes() {
        let dir = tempdir().expect("tempdir");
        let provider = Arc::new(ScriptedProvider::default().script(
            "eval/x",
            vec![Ok(GenerationResponse::from_text(
                "eval/x",
                "I would rate this response quite highly overall.",
            ))],
        ));
        let exec = executor(Arc::clone(&provider), dir.path());

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.layers["evaluation:eval/x"].parse_status,
            ParseStatus::NeedsManualReview
        );
    }

    #[tokio::test]
    async fn test_live_context_calls_provider() {
        let dir = tempdir().expect("tempdir");
        let mut def = definition();
        def.context_source = ContextSource::Live {
            model: "ctx/m".to_string(),
        };
        let provider = Arc::new(ScriptedProvider::default().script(
            "ctx/m",
            vec![Ok(GenerationResponse::from_text(
                "ctx/m",
                r#"{"facts": ["a", "b"]}"#,
            ))],
        ));
        let exec = PipelineExecutor::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            config(),
            Arc::new(def),
            dir.path(),
        );

        let outcome = exec.run_trial(&identity()).await.expect("run");
        assert!(outcome.is_completed());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        let context = exec
            .artifacts()
            .read_parsed(&ArtifactKey::new(Stage::Context, "trial_001"))
            .await
            .expect("read")
            .expect("artifact");
        assert!(!context.bypassed);
        assert_eq!(context.model, "ctx/m");
    }

    #[tokio::test]
    async fn test_unknown_scenario_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let exec = executor(Arc::new(ScriptedProvider::default()), dir.path());
        let mut id = identity();
        id.scenario_id = "missing".to_string();
        let err = exec.run_trial(&id).await.expect_err("unknown");
        assert!(matches!(err, ExecutorError::UnknownReference { kind: "scenario", .. }));
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let exec = PipelineExecutor::new(
            Arc::new(ScriptedProvider::default()),
            EngineConfig::default(),
            Arc::new(definition()),
            std::path::Path::new("/tmp"),
        );
        assert_eq!(
            exec.backoff_delay(1, ProviderErrorKind::Transient),
            Duration::from_secs(1)
        );
        assert_eq!(
            exec.backoff_delay(3, ProviderErrorKind::Transient),
            Duration::from_secs(4)
        );
        assert_eq!(
            exec.backoff_delay(1, ProviderErrorKind::RateLimited),
            Duration::from_secs(2)
        );
    }
}
