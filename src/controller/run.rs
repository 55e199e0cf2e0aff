//! Run controller: resolves a run, drives batches to completion and
//! finalizes.
//!
//! The controller is the only writer of the trial registry. Trials of a
//! batch execute concurrently (bounded by a semaphore) and their outcomes are
//! recorded one at a time as they finish, each persisted before the next is
//! looked at. Batches never overlap.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use super::progress::{ProgressCounters, ProgressMonitor};
use super::summary::{RunOutcome, RunSummary};
use crate::error::StateError;
use crate::llm::LlmProvider;
use crate::pipeline::{
    ConfigError, EngineConfig, ExecutorError, ExperimentDefinition, PipelineExecutor, StorageError,
};
use crate::scheduler::BatchScheduler;
use crate::state::{Run, RunLock, RunPlan, RunStore, TrialIdentity};
use crate::types::EvaluationStrategy;

/// Errors that stop a controller session.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Artifact storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<ExecutorError> for ControllerError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Storage(e) => ControllerError::Storage(e),
            other => ControllerError::State(StateError::Inconsistent(other.to_string())),
        }
    }
}

/// Parameters for creating a run from an experiment definition.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub definition: ExperimentDefinition,
    /// sha256 of the experiment file.
    pub digest: Option<String>,
    pub strategy: Option<EvaluationStrategy>,
    pub start_command: String,
}

/// Session-level options.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Stop cleanly after this many batches.
    pub max_batches: Option<usize>,
    /// Remove a leftover lock file before starting.
    pub force_unlock: bool,
    /// Only schedule pending trials of these models.
    pub model_filter: Option<Vec<String>>,
    pub progress_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_batches: None,
            force_unlock: false,
            model_filter: None,
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Drives runs under one runs directory.
pub struct RunController {
    store: RunStore,
    config: EngineConfig,
    provider: Arc<dyn LlmProvider>,
    options: ControllerOptions,
}

impl RunController {
    pub fn new(config: EngineConfig, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            store: RunStore::new(config.runs_dir.clone()),
            config,
            provider,
            options: ControllerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.options.max_batches = Some(max_batches);
        self
    }

    pub fn with_force_unlock(mut self, force: bool) -> Self {
        self.options.force_unlock = force;
        self
    }

    pub fn with_model_filter(mut self, models: Vec<String>) -> Self {
        self.options.model_filter = Some(models);
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a run and stores a snapshot of its definition.
    pub fn create_run(&self, new_run: NewRun) -> Result<Run, ControllerError> {
        let NewRun {
            mut definition,
            digest,
            strategy,
            start_command,
        } = new_run;
        definition.validate()?;
        if let Some(strategy) = strategy {
            definition.evaluation_strategy = strategy;
        }

        let run = self.store.create_run(RunPlan {
            scenario_ids: definition.scenario_ids(),
            framework_ids: definition.framework_ids(),
            model_ids: definition.models.clone(),
            evaluator_model_ids: definition.evaluator_models.clone(),
            evaluation_strategy: definition.evaluation_strategy,
            start_command,
            config_digest: digest,
        })?;
        run.write_definition(&definition)?;
        Ok(run)
    }

    /// Creates a run and executes it.
    pub async fn start(&self, new_run: NewRun) -> Result<RunSummary, ControllerError> {
        let run = self.create_run(new_run)?;
        self.execute(run).await
    }

    /// Resumes the named run, or the active one, and executes what is left.
    pub async fn resume(&self, run_id: Option<&str>) -> Result<RunSummary, ControllerError> {
        let run = self.store.resume_run(run_id)?;
        self.execute(run).await
    }

    /// Extends a run with new models without executing anything.
    pub fn add_models(
        &self,
        run_id: Option<&str>,
        models: &[String],
    ) -> Result<(Run, Vec<TrialIdentity>), ControllerError> {
        let mut run = self.store.resume_run(run_id)?;
        let _lock = RunLock::acquire(&run.state_dir(), self.options.force_unlock)?;

        let added = run.add_models(models)?;
        let mut definition: ExperimentDefinition = run.read_definition()?;
        for model in models {
            if !definition.models.contains(model) {
                definition.models.push(model.clone());
            }
        }
        run.write_definition(&definition)?;
        Ok((run, added))
    }

    /// Moves failed trials back to pending. `None` requeues every failed trial.
    pub fn requeue(
        &self,
        run_id: Option<&str>,
        trial_ids: Option<&[String]>,
    ) -> Result<(Run, Vec<String>), ControllerError> {
        let mut run = match run_id {
            Some(id) => self.store.open_run(id)?,
            None => self.store.resume_run(None)?,
        };
        let _lock = RunLock::acquire(&run.state_dir(), self.options.force_unlock)?;

        let requeued = run.registry_mut().requeue_failed(trial_ids)?;
        if !requeued.is_empty() {
            run.reopen()?;
        }
        Ok((run, requeued))
    }

    /// Summary of a run without executing anything.
    pub fn status(&self, run_id: Option<&str>) -> Result<RunSummary, ControllerError> {
        let run = match run_id {
            Some(id) => self.store.open_run(id)?,
            None => self.store.resume_run(None)?,
        };
        let counts = run.registry().counts();
        Ok(RunSummary::from_registry(
            run.run_id(),
            run.registry(),
            RunOutcome::classify(&counts, false),
            Vec::new(),
            0,
        ))
    }

    /// Runs batches until nothing eligible is pending, then finalizes.
    ///
    /// An empty pending set finalizes immediately without scheduling.
    pub async fn execute(&self, mut run: Run) -> Result<RunSummary, ControllerError> {
        self.config.validate()?;
        let _lock = RunLock::acquire(&run.state_dir(), self.options.force_unlock)?;

        let definition: ExperimentDefinition = run.read_definition()?;
        check_references(&run, &definition)?;

        let run_id = run.run_id().to_string();
        let executor = PipelineExecutor::new(
            Arc::clone(&self.provider),
            self.config.clone(),
            Arc::new(definition),
            run.dir(),
        )
        .with_evaluators(run.state().evaluator_model_ids.clone())
        .with_strategy(run.state().evaluation_strategy);

        let mut scheduler = BatchScheduler::new(self.config.batch_size_per_model);
        if let Some(models) = &self.options.model_filter {
            scheduler = scheduler.with_model_filter(models.iter().cloned());
        }

        let scheduled = scheduler.eligible(run.registry().pending_trials()).len();
        info!(
            run_id = %run_id,
            scheduled,
            total = run.registry().len(),
            per_model_cap = scheduler.per_model_cap(),
            "Starting run session"
        );

        let counters = ProgressCounters::new();
        let monitor = ProgressMonitor::start(
            run_id.clone(),
            counters.clone(),
            scheduled,
            self.options.progress_interval,
        );

        let result = self
            .drive(&mut run, &executor, &scheduler, &counters)
            .await;
        monitor.stop().await;
        let (executed, batches, stopped_early) = result?;

        if !stopped_early && run.registry().all_terminal() && !run.is_completed() {
            run.finalize()?;
        }

        let counts = run.registry().counts();
        let outcome = RunOutcome::classify(&counts, stopped_early);
        let summary = RunSummary::from_registry(&run_id, run.registry(), outcome, executed, batches);
        info!(
            run_id = %run_id,
            outcome = %outcome,
            completed = counts.completed,
            failed = counts.failed,
            pending = counts.pending + counts.in_progress,
            batches,
            "Run session finished"
        );
        Ok(summary)
    }

    /// The batch loop. Returns executed trial ids, batch count and whether
    /// the session stopped with eligible work left.
    async fn drive(
        &self,
        run: &mut Run,
        executor: &PipelineExecutor,
        scheduler: &BatchScheduler,
        counters: &ProgressCounters,
    ) -> Result<(Vec<String>, usize, bool), ControllerError> {
        let semaphore = Semaphore::new(self.config.max_concurrent_trials.max(1));
        let mut executed = Vec::new();
        let mut batches_run = 0usize;

        loop {
            let Some(batch) = scheduler.next_batch(run.registry().pending_trials(), batches_run + 1)
            else {
                return Ok((executed, batches_run, false));
            };
            if let Some(max) = self.options.max_batches {
                if batches_run >= max {
                    info!(run_id = %run.run_id(), max_batches = max, "Batch limit reached, stopping");
                    return Ok((executed, batches_run, true));
                }
            }
            if batches_run > 0 && !self.config.inter_batch_delay.is_zero() {
                debug!(delay_ms = self.config.inter_batch_delay.as_millis() as u64, "Pausing between batches");
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }

            info!(
                run_id = %run.run_id(),
                batch = batch.index,
                size = batch.len(),
                models = ?batch.model_counts(),
                "Starting batch"
            );
            for trial in &batch.trials {
                run.registry_mut().mark_in_progress(&trial.trial_id)?;
            }

            let mut in_flight = FuturesUnordered::new();
            for trial in &batch.trials {
                let semaphore = &semaphore;
                let counters = counters.clone();
                in_flight.push(async move {
                    // The semaphore is never closed.
                    let _permit = semaphore.acquire().await.ok();
                    counters.in_flight.fetch_add(1, Ordering::Relaxed);
                    let result = executor.run_trial(trial).await;
                    counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                    (trial, result)
                });
            }

            // Storage failures leave the trial in progress for the next
            // session; the rest of the batch is still recorded.
            let mut fatal: Option<ControllerError> = None;
            while let Some((trial, result)) = in_flight.next().await {
                match result {
                    Ok(outcome) => {
                        let registry = run.registry_mut();
                        match outcome.failure {
                            None => {
                                registry.mark_completed(&trial.trial_id, outcome.layers)?;
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Some(failure) => {
                                registry.mark_failed(&trial.trial_id, failure, outcome.layers)?;
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        executed.push(trial.trial_id.clone());
                    }
                    Err(err) => {
                        error!(trial_id = %trial.trial_id, error = %err, "Trial aborted");
                        fatal.get_or_insert(err.into());
                    }
                }
            }
            drop(in_flight);

            batches_run += 1;
            counters.batches.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = fatal {
                return Err(err);
            }
            let counts = run.registry().counts();
            info!(
                run_id = %run.run_id(),
                batch = batch.index,
                completed = counts.completed,
                failed = counts.failed,
                remaining = counts.pending + counts.in_progress,
                "Batch finished"
            );
        }
    }
}

/// Every registry entry must resolve against the stored definition.
fn check_references(run: &Run, definition: &ExperimentDefinition) -> Result<(), StateError> {
    let scenarios: HashSet<&str> = definition.scenarios.iter().map(|s| s.id.as_str()).collect();
    let frameworks: HashSet<&str> = definition.frameworks.iter().map(|f| f.id.as_str()).collect();
    for entry in run.registry().entries() {
        let id = &entry.identity;
        if !scenarios.contains(id.scenario_id.as_str()) {
            return Err(StateError::Inconsistent(format!(
                "{} references scenario '{}' missing from the stored definition",
                id.trial_id, id.scenario_id
            )));
        }
        if !frameworks.contains(id.framework_id.as_str()) {
            return Err(StateError::Inconsistent(format!(
                "{} references framework '{}' missing from the stored definition",
                id.trial_id, id.framework_id
            )));
        }
    }
    Ok(())
}
