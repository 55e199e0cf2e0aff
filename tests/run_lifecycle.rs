//! End-to-end run lifecycle tests against a scripted provider.
//!
//! No network: every provider call is answered by `MockProvider`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use trial_forge::controller::{ControllerError, NewRun, RunController, RunOutcome};
use trial_forge::error::{LlmError, StageFailureReason, StateError};
use trial_forge::llm::{GenerationRequest, GenerationResponse, LlmProvider};
use trial_forge::pipeline::{
    ArtifactKey, ArtifactWriter, AuditLog, ContextSource, EngineConfig, ExperimentDefinition,
    Framework, PromptOverrides, Scenario,
};
use trial_forge::state::{RunLock, TrialStatus};
use trial_forge::types::{EvaluationStrategy, Stage};

const COMPLETE: &str = r#"{"decision": "act", "reasoning": "it follows", "score": 72}"#;

/// Scripted provider: per-model queues first, then models marked failing,
/// then a complete default answer.
#[derive(Default)]
struct MockProvider {
    scripts: Mutex<HashMap<String, VecDeque<Result<GenerationResponse, LlmError>>>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    calls_by_model: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_in_flight: Mutex<HashMap<String, usize>>,
}

impl MockProvider {
    fn script(&self, model: &str, responses: Vec<Result<GenerationResponse, LlmError>>) {
        self.scripts
            .lock()
            .expect("lock")
            .entry(model.to_string())
            .or_default()
            .extend(responses);
    }

    fn set_failing(&self, model: &str, failing: bool) {
        let mut set = self.failing.lock().expect("lock");
        if failing {
            set.insert(model.to_string());
        } else {
            set.remove(model);
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn calls_for(&self, model: &str) -> usize {
        self.calls_by_model
            .lock()
            .expect("lock")
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    fn peak_for(&self, model: &str) -> usize {
        self.peak_in_flight
            .lock()
            .expect("lock")
            .get(model)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = request.model.clone();
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_model
            .lock()
            .expect("lock")
            .entry(model.clone())
            .or_default() += 1;
        {
            let mut in_flight = self.in_flight.lock().expect("lock");
            let current = in_flight.entry(model.clone()).or_default();
            *current += 1;
            let mut peak = self.peak_in_flight.lock().expect("lock");
            let max = peak.entry(model.clone()).or_default();
            *max = (*max).max(*current);
        }

        // Give concurrent calls a chance to overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;

        if let Some(n) = self.in_flight.lock().expect("lock").get_mut(&model) {
            *n -= 1;
        }

        let scripted = self
            .scripts
            .lock()
            .expect("lock")
            .get_mut(&model)
            .and_then(|q| q.pop_front());
        if let Some(response) = scripted {
            return response;
        }
        if self.failing.lock().expect("lock").contains(&model) {
            return Err(LlmError::ApiError {
                code: 503,
                message: "upstream overloaded".to_string(),
            });
        }
        Ok(GenerationResponse::from_text(model, COMPLETE))
    }
}

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
}

/// 3 scenarios x 2 frameworks x 2 models, one evaluator.
fn definition() -> ExperimentDefinition {
    ExperimentDefinition {
        scenarios: ids("s", 3)
            .into_iter()
            .map(|id| Scenario {
                description: format!("Scenario {}", id),
                facts: json!([format!("fact about {}", id)]),
                id,
            })
            .collect(),
        frameworks: ids("f", 2)
            .into_iter()
            .map(|id| Framework {
                description: format!("Framework {}", id),
                id,
            })
            .collect(),
        models: vec!["m1".to_string(), "m2".to_string()],
        evaluator_models: vec!["judge".to_string()],
        context_source: ContextSource::Config,
        evaluation_strategy: EvaluationStrategy::Holistic,
        prompts: PromptOverrides::default(),
        temperature: None,
    }
}

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig::default()
        .with_runs_dir(dir.path())
        .with_inter_batch_delay(Duration::ZERO)
        .with_backoff_base(Duration::from_millis(1))
        .with_call_timeout(Duration::from_secs(5))
}

fn new_run() -> NewRun {
    NewRun {
        definition: definition(),
        digest: None,
        strategy: None,
        start_command: "trial-forge run --experiment test.yaml".to_string(),
    }
}

fn controller(dir: &TempDir, provider: &Arc<MockProvider>) -> RunController {
    RunController::new(config(dir), Arc::clone(provider) as Arc<dyn LlmProvider>)
}

#[tokio::test]
async fn test_full_run_completes_every_trial() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);

    let summary = ctl.start(new_run()).await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.counts.completed, 12);
    assert_eq!(summary.executed.len(), 12);
    // Cap of one trial per model per batch, two models.
    assert_eq!(summary.batches, 6);
    // Context is bypassed: generation plus one evaluator per trial.
    assert_eq!(provider.calls(), 24);

    // Finalized: pointer cleared, directory kept.
    assert_eq!(ctl.store().pointer().current().expect("pointer"), None);
    let run = ctl.store().open_run(&summary.run_id).expect("open");
    assert!(run.is_completed());

    let audit = AuditLog::new(run.dir()).read_all().await.expect("audit");
    assert_eq!(audit.len(), 24);
}

#[tokio::test]
async fn test_raw_artifact_exists_for_every_parsed_artifact() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);
    let summary = ctl.start(new_run()).await.expect("run");

    let run = ctl.store().open_run(&summary.run_id).expect("open");
    let writer = ArtifactWriter::new(run.dir());
    for entry in run.registry().entries() {
        let keys = [
            ArtifactKey::new(Stage::Context, entry.trial_id()),
            ArtifactKey::new(Stage::Generation, entry.trial_id()),
            ArtifactKey::evaluation(entry.trial_id(), "judge"),
        ];
        for key in keys {
            let parsed = writer
                .read_parsed(&key)
                .await
                .expect("read")
                .expect("parsed artifact");
            for name in &parsed.raw_files {
                assert!(writer.stage_dir(key.stage).join(name).exists(), "{}", name);
            }
        }
    }
}

#[tokio::test]
async fn test_adding_a_model_runs_only_the_new_trials() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);
    let first = ctl.start(new_run()).await.expect("run");
    let calls_before = provider.calls();

    let (run, added) = ctl
        .add_models(Some(first.run_id.as_str()), &["m3".to_string()])
        .expect("add");
    assert_eq!(added.len(), 6);
    assert_eq!(added[0].trial_id, "trial_013");
    assert_eq!(added[5].trial_id, "trial_018");
    assert!(!run.is_completed());
    drop(run);

    let second = ctl.resume(None).await.expect("resume");
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(
        second.executed.iter().collect::<HashSet<_>>(),
        added.iter().map(|t| &t.trial_id).collect::<HashSet<_>>()
    );
    assert_eq!(provider.calls() - calls_before, 12);
    assert_eq!(provider.calls_for("m3"), 6);
    assert_eq!(second.counts.completed, 18);
}

#[tokio::test]
async fn test_stopping_between_batches_then_resuming_never_repeats_work() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());

    let first = controller(&dir, &provider)
        .with_max_batches(2)
        .start(new_run())
        .await
        .expect("first session");
    assert_eq!(first.outcome, RunOutcome::Stopped);
    assert_eq!(first.exit_code(), 3);
    assert_eq!(first.executed.len(), 4);
    assert_eq!(first.counts.pending, 8);

    let second = controller(&dir, &provider)
        .resume(None)
        .await
        .expect("second session");
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.executed.len(), 8);

    let first_set: HashSet<_> = first.executed.iter().collect();
    assert!(second.executed.iter().all(|id| !first_set.contains(id)));
    assert_eq!(provider.calls(), 24);
}

#[tokio::test]
async fn test_trial_killed_mid_flight_runs_exactly_once_on_resume() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);

    // Simulate a process that claimed trial_001 and died.
    let mut run = ctl.create_run(new_run()).expect("create");
    run.registry_mut()
        .mark_in_progress("trial_001")
        .expect("claim");
    let run_id = run.run_id().to_string();
    drop(run);

    let summary = ctl.resume(None).await.expect("resume");
    assert_eq!(summary.run_id, run_id);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(
        summary
            .executed
            .iter()
            .filter(|id| id.as_str() == "trial_001")
            .count(),
        1
    );
    assert_eq!(provider.calls(), 24);

    let run = ctl.store().open_run(&run_id).expect("open");
    let entry = run.registry().get("trial_001").expect("entry");
    assert_eq!(entry.status, TrialStatus::Completed);
    assert_eq!(entry.attempts, 2);
    let path: Vec<(TrialStatus, TrialStatus)> =
        entry.history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        path,
        vec![
            (TrialStatus::Pending, TrialStatus::InProgress),
            (TrialStatus::InProgress, TrialStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn test_resuming_a_finished_run_schedules_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);
    let first = ctl.start(new_run()).await.expect("run");
    let calls = provider.calls();

    let again = ctl.resume(Some(first.run_id.as_str())).await.expect("resume");
    assert_eq!(again.outcome, RunOutcome::Completed);
    assert_eq!(again.batches, 0);
    assert!(again.executed.is_empty());
    assert_eq!(provider.calls(), calls);
}

#[tokio::test]
async fn test_truncated_generation_records_escalated_budget() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    // trial_001 is the first m1 trial scheduled.
    provider.script(
        "m1",
        vec![
            Ok(GenerationResponse::from_text("m1", r#"{"decision": "act", "reasoning": "it fol"#)),
            Ok(GenerationResponse::from_text("m1", COMPLETE)),
        ],
    );
    let ctl = controller(&dir, &provider);
    let summary = ctl.start(new_run()).await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::Completed);

    let run = ctl.store().open_run(&summary.run_id).expect("open");
    let layer = &run.registry().get("trial_001").expect("entry").layers["generation"];
    assert_eq!(layer.tokens_budget_used, 4096);
    assert_eq!(layer.attempts, 2);
    assert_eq!(
        run.registry().get("trial_002").expect("entry").layers["generation"].tokens_budget_used,
        2048
    );
}

#[tokio::test]
async fn test_no_model_is_called_concurrently_beyond_its_cap() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let summary = controller(&dir, &provider)
        .start(new_run())
        .await
        .expect("run");
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(provider.peak_for("m1"), 1);
    assert_eq!(provider.peak_for("m2"), 1);
}

#[tokio::test]
async fn test_failures_give_distinct_exit_code_and_can_be_requeued() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    provider.set_failing("m2", true);
    let ctl = controller(&dir, &provider);

    let summary = ctl.start(new_run()).await.expect("run");
    assert_eq!(summary.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.counts.completed, 6);
    assert_eq!(summary.failed.len(), 6);
    for failed in &summary.failed {
        assert_eq!(failed.model_id, "m2");
        let failure = failed.failure.as_ref().expect("reason");
        assert_eq!(failure.stage, Stage::Generation);
        assert_eq!(failure.model, "m2");
        assert!(matches!(
            failure.reason,
            StageFailureReason::TransportExhausted { attempts: 3, .. }
        ));
    }
    assert!(summary.render().contains("completed-with-failures"));

    // Operator requeues after the provider recovers.
    provider.set_failing("m2", false);
    let (run, requeued) = ctl.requeue(Some(summary.run_id.as_str()), None).expect("requeue");
    assert_eq!(requeued.len(), 6);
    assert!(!run.is_completed());
    drop(run);

    let retry = ctl.resume(None).await.expect("resume");
    assert_eq!(retry.outcome, RunOutcome::Completed);
    assert_eq!(retry.executed.len(), 6);
    assert_eq!(retry.counts.completed, 12);
}

#[tokio::test]
async fn test_requeued_trial_keeps_raw_output_of_both_executions() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    provider.set_failing("judge", true);
    let ctl = controller(&dir, &provider);

    let summary = ctl.start(new_run()).await.expect("run");
    assert_eq!(summary.counts.failed, 12);

    provider.set_failing("judge", false);
    let only = vec!["trial_001".to_string()];
    let (run, requeued) = ctl
        .requeue(Some(summary.run_id.as_str()), Some(only.as_slice()))
        .expect("requeue");
    assert_eq!(requeued, vec!["trial_001".to_string()]);
    drop(run);
    let retry = ctl
        .resume(Some(summary.run_id.as_str()))
        .await
        .expect("resume");
    assert_eq!(retry.executed, vec!["trial_001".to_string()]);

    let run = ctl.store().open_run(&summary.run_id).expect("open");
    let writer = ArtifactWriter::new(run.dir());
    let key = ArtifactKey::new(Stage::Generation, "trial_001");
    let first = std::fs::read_to_string(writer.raw_path(&key, 1)).expect("first execution raw");
    assert_eq!(first, COMPLETE);
    assert!(writer.raw_path(&key, 2).exists());

    let parsed = writer
        .read_parsed(&key)
        .await
        .expect("read")
        .expect("parsed artifact");
    assert_eq!(parsed.raw_files, vec!["trial_001.raw.2.txt".to_string()]);
    assert_eq!(
        run.registry().get("trial_001").expect("entry").status,
        TrialStatus::Completed
    );
}

#[tokio::test]
async fn test_locked_run_refuses_second_session() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let ctl = controller(&dir, &provider);
    let run = ctl.create_run(new_run()).expect("create");
    let _held = RunLock::acquire(&run.state_dir(), false).expect("lock");
    drop(run);

    let err = ctl.resume(None).await.expect_err("locked");
    assert!(matches!(err, ControllerError::State(StateError::Locked { .. })));
    assert_eq!(provider.calls(), 0);

    let forced = controller(&dir, &provider)
        .with_force_unlock(true)
        .resume(None)
        .await
        .expect("forced");
    assert_eq!(forced.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_resume_without_active_run_fails_to_start() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let err = controller(&dir, &provider)
        .resume(None)
        .await
        .expect_err("no run");
    assert!(matches!(err, ControllerError::State(StateError::NoActiveRun)));
}

#[tokio::test]
async fn test_model_filter_limits_scheduling_on_resume() {
    let dir = TempDir::new().expect("tempdir");
    let provider = Arc::new(MockProvider::default());
    let run = controller(&dir, &provider)
        .create_run(new_run())
        .expect("create");
    let run_id = run.run_id().to_string();
    drop(run);

    let summary = controller(&dir, &provider)
        .with_model_filter(vec!["m2".to_string()])
        .resume(Some(run_id.as_str()))
        .await
        .expect("resume");
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.counts.completed, 6);
    assert_eq!(summary.counts.pending, 6);
    assert_eq!(provider.calls_for("m1"), 0);
}
