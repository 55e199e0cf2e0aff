//! Durable per-run trial registry.
//!
//! One JSON file maps every `trial_id` to its identity, status, transition
//! history and a compact per-stage summary. Response text never lands here;
//! it lives in the stage artifact files.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StageError, StateError};
use crate::types::ParseStatus;
use crate::utils::atomic_write_json;

/// Name of the registry file inside a run's state directory.
pub const REGISTRY_FILENAME: &str = "registry.json";

/// Immutable identity of a trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialIdentity {
    pub trial_id: String,
    pub scenario_id: String,
    pub framework_id: String,
    pub model_id: String,
}

/// Formats the `n`th trial id (1-based): `trial_001`, `trial_002`, ...
pub fn format_trial_id(n: u32) -> String {
    format!("trial_{:03}", n)
}

/// Lifecycle status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TrialStatus {
    /// Statuses reachable from `self`.
    ///
    /// `Failed -> Pending` is only taken by [`TrialRegistry::requeue_failed`].
    pub fn valid_targets(self) -> &'static [TrialStatus] {
        match self {
            TrialStatus::Pending => &[TrialStatus::InProgress],
            TrialStatus::InProgress => &[TrialStatus::Completed, TrialStatus::Failed],
            TrialStatus::Completed => &[],
            TrialStatus::Failed => &[TrialStatus::Pending],
        }
    }

    pub fn can_transition(self, to: TrialStatus) -> bool {
        self.valid_targets().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TrialStatus::Completed | TrialStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::Pending => "pending",
            TrialStatus::InProgress => "in_progress",
            TrialStatus::Completed => "completed",
            TrialStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: TrialStatus,
    pub to: TrialStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of one stage call site (one evaluator counts as one site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub parse_status: ParseStatus,
    pub tokens_budget_used: u32,
    pub attempts: u32,
}

/// Registry record for one trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub identity: TrialIdentity,
    /// 1-based position in enumeration order.
    pub sequence: u32,
    pub status: TrialStatus,
    /// Times the trial was claimed for execution.
    #[serde(default)]
    pub attempts: u32,
    /// Keyed by stage, or `evaluation:<model>` for evaluators.
    #[serde(default)]
    pub layers: BTreeMap<String, LayerSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageError>,
    #[serde(default)]
    pub history: Vec<StatusTransition>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    fn new(identity: TrialIdentity, sequence: u32) -> Self {
        Self {
            identity,
            sequence,
            status: TrialStatus::Pending,
            attempts: 0,
            layers: BTreeMap::new(),
            failure: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn trial_id(&self) -> &str {
        &self.identity.trial_id
    }
}

/// Counts of trials by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

/// The trial registry of one run, persisted after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRegistry {
    #[serde(skip)]
    path: PathBuf,
    /// Last sequence number handed out; ids continue from here.
    last_sequence: u32,
    trials: BTreeMap<String, RegistryEntry>,
}

impl TrialRegistry {
    /// Creates a registry of `pending` trials at `path` and writes it.
    pub fn create(path: PathBuf, identities: Vec<TrialIdentity>) -> Result<Self, StateError> {
        let mut registry = Self {
            path,
            last_sequence: 0,
            trials: BTreeMap::new(),
        };
        registry.insert_all(identities)?;
        registry.save()?;
        Ok(registry)
    }

    /// Loads the registry at `path`.
    ///
    /// A missing, undecodable, or self-inconsistent file is a `StateError`;
    /// nothing is repaired.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            return Err(StateError::Inconsistent(format!(
                "registry file {:?} is missing",
                path
            )));
        }
        let contents = fs::read_to_string(path)?;
        let mut registry: TrialRegistry =
            serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        registry.path = path.to_path_buf();
        registry.check_consistency()?;
        debug!(path = %path.display(), trials = registry.trials.len(), "Loaded trial registry");
        Ok(registry)
    }

    fn check_consistency(&self) -> Result<(), StateError> {
        for (key, entry) in &self.trials {
            if key != entry.trial_id() {
                return Err(StateError::Inconsistent(format!(
                    "registry key '{}' holds trial '{}'",
                    key,
                    entry.trial_id()
                )));
            }
            if entry.sequence == 0 || entry.sequence > self.last_sequence {
                return Err(StateError::Inconsistent(format!(
                    "trial '{}' has sequence {} beyond last issued {}",
                    key, entry.sequence, self.last_sequence
                )));
            }
        }
        Ok(())
    }

    /// Writes the registry atomically.
    pub fn save(&self) -> Result<(), StateError> {
        atomic_write_json(&self.path, self)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Id the next appended trial will receive.
    pub fn next_trial_id(&self) -> String {
        format_trial_id(self.last_sequence + 1)
    }

    /// Highest sequence number issued so far.
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Appends new `pending` trials and persists.
    pub fn append(&mut self, identities: Vec<TrialIdentity>) -> Result<(), StateError> {
        self.insert_all(identities)?;
        self.save()
    }

    fn insert_all(&mut self, identities: Vec<TrialIdentity>) -> Result<(), StateError> {
        for identity in identities {
            if self.trials.contains_key(&identity.trial_id) {
                return Err(StateError::Inconsistent(format!(
                    "trial id '{}' already exists",
                    identity.trial_id
                )));
            }
            let sequence = parse_sequence(&identity.trial_id).ok_or_else(|| {
                StateError::Inconsistent(format!("malformed trial id '{}'", identity.trial_id))
            })?;
            self.last_sequence = self.last_sequence.max(sequence);
            self.trials
                .insert(identity.trial_id.clone(), RegistryEntry::new(identity, sequence));
        }
        Ok(())
    }

    pub fn get(&self, trial_id: &str) -> Option<&RegistryEntry> {
        self.trials.get(trial_id)
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// All entries in enumeration order.
    pub fn entries(&self) -> Vec<&RegistryEntry> {
        let mut entries: Vec<&RegistryEntry> = self.trials.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Trials that still need to run, in enumeration order.
    ///
    /// `in_progress` entries are included: they are only observed here when a
    /// previous process died before recording an outcome.
    pub fn pending_trials(&self) -> Vec<TrialIdentity> {
        self.entries()
            .into_iter()
            .filter(|e| matches!(e.status, TrialStatus::Pending | TrialStatus::InProgress))
            .map(|e| e.identity.clone())
            .collect()
    }

    pub fn failed_trials(&self) -> Vec<&RegistryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.status == TrialStatus::Failed)
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.trials.values() {
            match entry.status {
                TrialStatus::Pending => counts.pending += 1,
                TrialStatus::InProgress => counts.in_progress += 1,
                TrialStatus::Completed => counts.completed += 1,
                TrialStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Whether every trial reached `completed` or `failed`.
    pub fn all_terminal(&self) -> bool {
        self.trials.values().all(|e| e.status.is_terminal())
    }

    /// Claims a trial for execution and persists.
    ///
    /// A stale `in_progress` entry (left by a killed process) is reclaimed by
    /// bumping `attempts` only, so the history never shows a self-transition.
    pub fn mark_in_progress(&mut self, trial_id: &str) -> Result<(), StateError> {
        let entry = self.entry_mut(trial_id)?;
        match entry.status {
            TrialStatus::InProgress => {
                debug!(trial_id, "Reclaiming stale in-progress trial");
                entry.attempts += 1;
                entry.updated_at = Utc::now();
            }
            _ => {
                transition(entry, TrialStatus::InProgress, None)?;
                entry.attempts += 1;
            }
        }
        self.save()
    }

    /// Records a successful trial with its per-stage summary and persists.
    pub fn mark_completed(
        &mut self,
        trial_id: &str,
        layers: BTreeMap<String, LayerSummary>,
    ) -> Result<(), StateError> {
        let entry = self.entry_mut(trial_id)?;
        transition(entry, TrialStatus::Completed, None)?;
        entry.layers = layers;
        entry.failure = None;
        self.save()
    }

    /// Records a failed trial with its stage-attributed reason and persists.
    pub fn mark_failed(
        &mut self,
        trial_id: &str,
        failure: StageError,
        layers: BTreeMap<String, LayerSummary>,
    ) -> Result<(), StateError> {
        let entry = self.entry_mut(trial_id)?;
        transition(entry, TrialStatus::Failed, Some(failure.to_string()))?;
        entry.layers = layers;
        entry.failure = Some(failure);
        self.save()
    }

    /// Moves failed trials back to `pending` and persists.
    ///
    /// With `trial_ids = None` every failed trial is requeued. Naming a trial
    /// that is not `failed` is an error and nothing is changed. Repeated ids
    /// are requeued once.
    pub fn requeue_failed(&mut self, trial_ids: Option<&[String]>) -> Result<Vec<String>, StateError> {
        let targets: Vec<String> = match trial_ids {
            Some(ids) => {
                let mut seen = HashSet::new();
                let ids: Vec<String> = ids
                    .iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .cloned()
                    .collect();
                for id in &ids {
                    let entry = self
                        .trials
                        .get(id)
                        .ok_or_else(|| StateError::TrialNotFound(id.clone()))?;
                    if entry.status != TrialStatus::Failed {
                        return Err(StateError::InvalidTransition {
                            trial_id: id.clone(),
                            from: entry.status.to_string(),
                            to: TrialStatus::Pending.to_string(),
                        });
                    }
                }
                ids
            }
            None => self
                .failed_trials()
                .into_iter()
                .map(|e| e.identity.trial_id.clone())
                .collect(),
        };

        for id in &targets {
            let entry = self.entry_mut(id)?;
            transition(entry, TrialStatus::Pending, Some("requeued by operator".to_string()))?;
            entry.failure = None;
        }
        if !targets.is_empty() {
            self.save()?;
            info!(count = targets.len(), "Requeued failed trials");
        }
        Ok(targets)
    }

    /// Counts of final parse status per stage key.
    pub fn parse_quality(&self) -> BTreeMap<String, BTreeMap<ParseStatus, usize>> {
        let mut out: BTreeMap<String, BTreeMap<ParseStatus, usize>> = BTreeMap::new();
        for entry in self.trials.values() {
            for (key, layer) in &entry.layers {
                let stage = key.split(':').next().unwrap_or(key).to_string();
                *out.entry(stage)
                    .or_default()
                    .entry(layer.parse_status)
                    .or_default() += 1;
            }
        }
        out
    }

    fn entry_mut(&mut self, trial_id: &str) -> Result<&mut RegistryEntry, StateError> {
        self.trials
            .get_mut(trial_id)
            .ok_or_else(|| StateError::TrialNotFound(trial_id.to_string()))
    }
}

fn transition(
    entry: &mut RegistryEntry,
    to: TrialStatus,
    reason: Option<String>,
) -> Result<(), StateError> {
    let from = entry.status;
    if !from.can_transition(to) {
        return Err(StateError::InvalidTransition {
            trial_id: entry.identity.trial_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let at = Utc::now();
    entry.status = to;
    entry.updated_at = at;
    entry.history.push(StatusTransition { from, to, at, reason });
    debug!(trial_id = %entry.identity.trial_id, %from, %to, "Trial status changed");
    Ok(())
}

fn parse_sequence(trial_id: &str) -> Option<u32> {
    trial_id.strip_prefix("trial_")?.parse().ok()
}
