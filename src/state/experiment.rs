//! Run creation, resumption and finalization.
//!
//! A run lives in `<runs_dir>/<run_id>/`. Its `state/` subdirectory holds the
//! experiment record, the trial registry, a snapshot of the experiment
//! definition and, while a process drives it, the operation lock. Run
//! directories are never deleted; finalizing only flips the status and
//! clears the run pointer.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::pointer::RunPointer;
use super::registry::{format_trial_id, TrialIdentity, TrialRegistry, REGISTRY_FILENAME};
use crate::error::StateError;
use crate::types::EvaluationStrategy;
use crate::utils::atomic_write_json;

pub const STATE_DIRNAME: &str = "state";
pub const EXPERIMENT_FILENAME: &str = "experiment.json";
pub const DEFINITION_FILENAME: &str = "definition.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
}

/// Durable description of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentState {
    pub run_id: String,
    pub scenario_ids: Vec<String>,
    pub framework_ids: Vec<String>,
    pub model_ids: Vec<String>,
    pub evaluator_model_ids: Vec<String>,
    pub evaluation_strategy: EvaluationStrategy,
    /// Command line that created the run.
    pub start_command: String,
    /// sha256 of the experiment file the run was created from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Everything needed to create a run.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub scenario_ids: Vec<String>,
    pub framework_ids: Vec<String>,
    pub model_ids: Vec<String>,
    pub evaluator_model_ids: Vec<String>,
    pub evaluation_strategy: EvaluationStrategy,
    pub start_command: String,
    pub config_digest: Option<String>,
}

/// Enumerates scenario × framework × model, numbering from `first_sequence`.
pub fn enumerate_trials(
    scenario_ids: &[String],
    framework_ids: &[String],
    model_ids: &[String],
    first_sequence: u32,
) -> Vec<TrialIdentity> {
    let mut next = first_sequence;
    let mut trials = Vec::with_capacity(scenario_ids.len() * framework_ids.len() * model_ids.len());
    for scenario in scenario_ids {
        for framework in framework_ids {
            for model in model_ids {
                trials.push(TrialIdentity {
                    trial_id: format_trial_id(next),
                    scenario_id: scenario.clone(),
                    framework_id: framework.clone(),
                    model_id: model.clone(),
                });
                next += 1;
            }
        }
    }
    trials
}

/// The directory holding every run plus the run pointer.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    pointer: RunPointer,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        let runs_dir = runs_dir.into();
        let pointer = RunPointer::new(&runs_dir);
        Self { runs_dir, pointer }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn pointer(&self) -> &RunPointer {
        &self.pointer
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Creates a run: enumerates trials, writes the pending registry and the
    /// experiment record, then points the run pointer at it.
    pub fn create_run(&self, plan: RunPlan) -> Result<Run, StateError> {
        let trials = enumerate_trials(&plan.scenario_ids, &plan.framework_ids, &plan.model_ids, 1);
        if trials.is_empty() {
            return Err(StateError::Inconsistent(
                "run would contain no trials".to_string(),
            ));
        }

        if let Some(active) = self.pointer.current()? {
            warn!(previous_run = %active, "Creating a new run while another is active; it stays resumable by id");
        }

        let run_id = self.fresh_run_id();
        let dir = self.run_dir(&run_id);
        let state_dir = dir.join(STATE_DIRNAME);
        fs::create_dir_all(&state_dir)?;

        let now = Utc::now();
        let state = ExperimentState {
            run_id: run_id.clone(),
            scenario_ids: plan.scenario_ids,
            framework_ids: plan.framework_ids,
            model_ids: plan.model_ids,
            evaluator_model_ids: plan.evaluator_model_ids,
            evaluation_strategy: plan.evaluation_strategy,
            start_command: plan.start_command,
            config_digest: plan.config_digest,
            status: RunStatus::InProgress,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        };

        let registry = TrialRegistry::create(state_dir.join(REGISTRY_FILENAME), trials)?;
        let run = Run {
            dir,
            state,
            registry,
            pointer: self.pointer.clone(),
        };
        run.save_state()?;
        self.pointer.set(&run_id)?;

        info!(run_id = %run_id, trials = run.registry.len(), "Created run");
        Ok(run)
    }

    /// Loads the run named by `run_id`, or by the pointer when `None`.
    pub fn resume_run(&self, run_id: Option<&str>) -> Result<Run, StateError> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self.pointer.current()?.ok_or(StateError::NoActiveRun)?,
        };
        let run = self.open_run(&run_id)?;
        info!(
            run_id = %run_id,
            pending = run.registry.pending_trials().len(),
            "Resumed run"
        );
        Ok(run)
    }

    /// Loads a run by id without touching the pointer.
    pub fn open_run(&self, run_id: &str) -> Result<Run, StateError> {
        let dir = self.run_dir(run_id);
        let state_dir = dir.join(STATE_DIRNAME);
        let state_path = state_dir.join(EXPERIMENT_FILENAME);
        if !state_path.exists() {
            return Err(StateError::RunNotFound(run_id.to_string()));
        }

        let contents = fs::read_to_string(&state_path)?;
        let state: ExperimentState =
            serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
                path: state_path.clone(),
                message: e.to_string(),
            })?;
        if state.run_id != run_id {
            return Err(StateError::Inconsistent(format!(
                "directory '{}' holds state for run '{}'",
                run_id, state.run_id
            )));
        }

        let registry = TrialRegistry::load(&state_dir.join(REGISTRY_FILENAME))?;
        Ok(Run {
            dir,
            state,
            registry,
            pointer: self.pointer.clone(),
        })
    }

    fn fresh_run_id(&self) -> String {
        let base = Utc::now().format("run_%Y%m%d_%H%M%S").to_string();
        if !self.run_dir(&base).exists() {
            return base;
        }
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}", base, &suffix[..8])
    }
}

/// A loaded run: experiment record plus registry.
#[derive(Debug)]
pub struct Run {
    dir: PathBuf,
    state: ExperimentState,
    registry: TrialRegistry,
    pointer: RunPointer,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.join(STATE_DIRNAME)
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    pub fn registry(&self) -> &TrialRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TrialRegistry {
        &mut self.registry
    }

    pub fn save_state(&self) -> Result<(), StateError> {
        atomic_write_json(&self.state_dir().join(EXPERIMENT_FILENAME), &self.state)?;
        Ok(())
    }

    /// Stores a copy of the experiment definition inside the run.
    pub fn write_definition<T: Serialize>(&self, definition: &T) -> Result<(), StateError> {
        atomic_write_json(&self.state_dir().join(DEFINITION_FILENAME), definition)?;
        Ok(())
    }

    pub fn read_definition<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        let path = self.state_dir().join(DEFINITION_FILENAME);
        if !path.exists() {
            return Err(StateError::Inconsistent(format!(
                "experiment definition {:?} is missing",
                path
            )));
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
            path,
            message: e.to_string(),
        })
    }

    /// Extends the run with `new_models`, appending trials that continue the
    /// id sequence. Models the run already has are skipped.
    ///
    /// A completed run is reopened and becomes the active run again.
    pub fn add_models(&mut self, new_models: &[String]) -> Result<Vec<TrialIdentity>, StateError> {
        let mut known: BTreeSet<String> = self.state.model_ids.iter().cloned().collect();
        known.extend(
            self.registry
                .entries()
                .into_iter()
                .map(|e| e.identity.model_id.clone()),
        );

        let mut fresh: Vec<String> = Vec::new();
        for model in new_models {
            if !known.contains(model) && !fresh.contains(model) {
                fresh.push(model.clone());
            }
        }

        let trials = enumerate_trials(
            &self.state.scenario_ids,
            &self.state.framework_ids,
            &fresh,
            self.registry.last_sequence() + 1,
        );
        if !trials.is_empty() {
            self.registry.append(trials.clone())?;
        }

        for model in new_models {
            if !self.state.model_ids.contains(model) {
                self.state.model_ids.push(model.clone());
            }
        }
        if !trials.is_empty() {
            self.reopen()?;
        }
        self.state.updated_at = Utc::now();
        self.save_state()?;

        info!(
            run_id = %self.state.run_id,
            models = ?fresh,
            added = trials.len(),
            "Added models to run"
        );
        Ok(trials)
    }

    /// Puts a completed run back in progress and makes it the active run.
    /// Returns whether the status changed.
    pub fn reopen(&mut self) -> Result<bool, StateError> {
        let reopened = self.state.status == RunStatus::Completed;
        if reopened {
            info!(run_id = %self.state.run_id, "Reopening completed run");
            self.state.status = RunStatus::InProgress;
            self.state.finalized_at = None;
            self.state.updated_at = Utc::now();
            self.save_state()?;
        }
        self.pointer.set(&self.state.run_id)?;
        Ok(reopened)
    }

    pub fn is_completed(&self) -> bool {
        self.state.status == RunStatus::Completed
    }

    /// Marks the run completed and clears the pointer if it names this run.
    pub fn finalize(&mut self) -> Result<(), StateError> {
        if !self.registry.all_terminal() {
            return Err(StateError::Inconsistent(format!(
                "cannot finalize run '{}' with non-terminal trials",
                self.state.run_id
            )));
        }
        let now = Utc::now();
        self.state.status = RunStatus::Completed;
        self.state.updated_at = now;
        self.state.finalized_at = Some(now);
        self.save_state()?;
        self.pointer.clear_if(&self.state.run_id)?;
        info!(run_id = %self.state.run_id, "Run finalized");
        Ok(())
    }
}
