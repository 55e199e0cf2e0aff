//! Round-robin batch construction.

use std::collections::{HashSet, VecDeque};

use crate::state::TrialIdentity;

/// A group of trials executed concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based position in the session.
    pub index: usize,
    pub trials: Vec<TrialIdentity>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Number of trials per model, in first-appearance order.
    pub fn model_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for trial in &self.trials {
            match counts.iter_mut().find(|(m, _)| *m == trial.model_id) {
                Some((_, n)) => *n += 1,
                None => counts.push((trial.model_id.clone(), 1)),
            }
        }
        counts
    }

    pub fn trial_ids(&self) -> Vec<&str> {
        self.trials.iter().map(|t| t.trial_id.as_str()).collect()
    }
}

/// Splits pending trials into rate-limit-safe batches.
///
/// Trials are grouped by model, preserving registry order inside each group.
/// Each batch takes up to `per_model_cap` trials from every group in turn,
/// so no model ever appears more than `per_model_cap` times in one batch.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    per_model_cap: usize,
    models: Option<HashSet<String>>,
}

impl BatchScheduler {
    /// A cap of zero is treated as one.
    pub fn new(per_model_cap: usize) -> Self {
        Self {
            per_model_cap: per_model_cap.max(1),
            models: None,
        }
    }

    /// Only schedule trials for these models. Other pending trials are left
    /// untouched in the registry.
    pub fn with_model_filter<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn per_model_cap(&self) -> usize {
        self.per_model_cap
    }

    /// Pending trials this scheduler would run.
    pub fn eligible(&self, pending: Vec<TrialIdentity>) -> Vec<TrialIdentity> {
        match &self.models {
            Some(models) => pending
                .into_iter()
                .filter(|t| models.contains(&t.model_id))
                .collect(),
            None => pending,
        }
    }

    /// The full interleaving of `pending` into batches, numbered from
    /// `first_index`.
    pub fn build_batches(&self, pending: Vec<TrialIdentity>, first_index: usize) -> Vec<Batch> {
        let mut groups = group_by_model(self.eligible(pending));
        let mut batches = Vec::new();
        let mut index = first_index;

        while groups.iter().any(|g| !g.is_empty()) {
            let mut trials = Vec::new();
            for group in groups.iter_mut() {
                for _ in 0..self.per_model_cap {
                    match group.pop_front() {
                        Some(trial) => trials.push(trial),
                        None => break,
                    }
                }
            }
            batches.push(Batch { index, trials });
            index += 1;
        }
        batches
    }

    /// Only the first batch of [`build_batches`](Self::build_batches).
    ///
    /// The controller calls this after every batch against the freshly
    /// persisted registry, so trials recorded in the meantime are never
    /// scheduled twice.
    pub fn next_batch(&self, pending: Vec<TrialIdentity>, index: usize) -> Option<Batch> {
        self.build_batches(pending, index).into_iter().next()
    }
}

/// Groups trials by model in order of each model's first appearance.
fn group_by_model(trials: Vec<TrialIdentity>) -> Vec<VecDeque<TrialIdentity>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: Vec<VecDeque<TrialIdentity>> = Vec::new();
    for trial in trials {
        match order.iter().position(|m| *m == trial.model_id) {
            Some(i) => groups[i].push_back(trial),
            None => {
                order.push(trial.model_id.clone());
                groups.push(VecDeque::from([trial]));
            }
        }
    }
    groups
}
