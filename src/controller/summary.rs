//! End-of-run summary and exit codes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::StageError;
use crate::state::{StatusCounts, TrialRegistry};
use crate::types::ParseStatus;

/// Exit code when a run could not start (state or configuration error).
pub const EXIT_FAILED_TO_START: i32 = 1;

/// How a controller session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every trial completed.
    Completed,
    /// Every trial is terminal but some failed.
    CompletedWithFailures,
    /// The session ended with trials still pending; the run is resumable.
    Stopped,
}

impl RunOutcome {
    /// Derives the outcome from registry counts.
    pub fn classify(counts: &StatusCounts, stopped_early: bool) -> Self {
        if stopped_early || counts.pending + counts.in_progress > 0 {
            RunOutcome::Stopped
        } else if counts.failed > 0 {
            RunOutcome::CompletedWithFailures
        } else {
            RunOutcome::Completed
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::CompletedWithFailures => 2,
            RunOutcome::Stopped => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompletedWithFailures => "completed-with-failures",
            RunOutcome::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed trial with its stage-attributed reason.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTrial {
    pub trial_id: String,
    pub scenario_id: String,
    pub framework_id: String,
    pub model_id: String,
    pub failure: Option<StageError>,
}

/// What a session did and where the run stands.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub counts: StatusCounts,
    /// Trials executed this session, in recording order.
    pub executed: Vec<String>,
    pub batches: usize,
    pub failed: Vec<FailedTrial>,
    /// Final parse status counts per stage.
    pub parse_quality: BTreeMap<String, BTreeMap<ParseStatus, usize>>,
}

impl RunSummary {
    pub fn from_registry(
        run_id: impl Into<String>,
        registry: &TrialRegistry,
        outcome: RunOutcome,
        executed: Vec<String>,
        batches: usize,
    ) -> Self {
        let failed = registry
            .failed_trials()
            .into_iter()
            .map(|e| FailedTrial {
                trial_id: e.identity.trial_id.clone(),
                scenario_id: e.identity.scenario_id.clone(),
                framework_id: e.identity.framework_id.clone(),
                model_id: e.identity.model_id.clone(),
                failure: e.failure.clone(),
            })
            .collect();
        Self {
            run_id: run_id.into(),
            outcome,
            counts: registry.counts(),
            executed,
            batches,
            failed,
            parse_quality: registry.parse_quality(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Human-readable report for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = &self.counts;
        let _ = writeln!(out, "Run {}: {}", self.run_id, self.outcome);
        let _ = writeln!(
            out,
            "  trials: {} total, {} completed, {} failed, {} pending, {} in progress",
            c.total(),
            c.completed,
            c.failed,
            c.pending,
            c.in_progress
        );
        if self.batches > 0 || !self.executed.is_empty() {
            let _ = writeln!(
                out,
                "  this session: {} trials in {} batches",
                self.executed.len(),
                self.batches
            );
        }
        if !self.parse_quality.is_empty() {
            let _ = writeln!(out, "  parse quality:");
            for (stage, statuses) in &self.parse_quality {
                let parts: Vec<String> = statuses
                    .iter()
                    .rev()
                    .map(|(status, n)| format!("{} {}", n, status))
                    .collect();
                let _ = writeln!(out, "    {:<12} {}", stage, parts.join(", "));
            }
        }
        if !self.failed.is_empty() {
            let _ = writeln!(out, "  failed trials:");
            for trial in &self.failed {
                let reason = trial
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(
                    out,
                    "    {} [{} / {} / {}] {}",
                    trial.trial_id, trial.scenario_id, trial.framework_id, trial.model_id, reason
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: usize, in_progress: usize, completed: usize, failed: usize) -> StatusCounts {
        StatusCounts {
            pending,
            in_progress,
            completed,
            failed,
        }
    }

    #[test]
    fn test_classify_and_exit_codes() {
        let ok = RunOutcome::classify(&counts(0, 0, 12, 0), false);
        assert_eq!(ok, RunOutcome::Completed);
        assert_eq!(ok.exit_code(), 0);

        let partial = RunOutcome::classify(&counts(0, 0, 10, 2), false);
        assert_eq!(partial, RunOutcome::CompletedWithFailures);
        assert_eq!(partial.exit_code(), 2);

        assert_eq!(
            RunOutcome::classify(&counts(3, 0, 9, 0), false),
            RunOutcome::Stopped
        );
        assert_eq!(
            RunOutcome::classify(&counts(0, 0, 12, 0), true).exit_code(),
            3
        );
        assert_ne!(EXIT_FAILED_TO_START, ok.exit_code());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&RunOutcome::CompletedWithFailures).expect("json");
        assert_eq!(json, "\"completed_with_failures\"");
    }
}
