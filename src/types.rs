//! Small shared vocabulary types used across the engine.

use serde::{Deserialize, Serialize};

/// One of the three fixed pipeline stages every trial passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage A: establish the facts of the scenario.
    Context,
    /// Stage B: generate a response under a framework.
    Generation,
    /// Stage C: score the generated response.
    Evaluation,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Context, Stage::Generation, Stage::Evaluation];

    /// Directory name holding this stage's artifacts inside a run directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Context => "stage_a_context",
            Stage::Generation => "stage_b_generation",
            Stage::Evaluation => "stage_c_evaluation",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Context => "context",
            Stage::Generation => "generation",
            Stage::Evaluation => "evaluation",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How successfully a raw response was turned into structured data.
///
/// Ordered from worst to best so `max` picks the better outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    /// No response text to parse (the call never produced output).
    Failed,
    /// Text was present but no strategy recovered a structure.
    NeedsManualReview,
    /// A structure was recovered but some required fields are missing.
    PartialSuccess,
    /// A structure with every required field was recovered.
    Success,
}

impl ParseStatus {
    /// Whether the parse produced usable structured data.
    pub fn is_usable(self) -> bool {
        matches!(self, ParseStatus::Success | ParseStatus::PartialSuccess)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Failed => "failed",
            ParseStatus::NeedsManualReview => "needs_manual_review",
            ParseStatus::PartialSuccess => "partial_success",
            ParseStatus::Success => "success",
        }
    }
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scoring-rubric variant evaluators are asked to apply.
///
/// The engine only selects the rubric text; scores come back as an opaque
/// structured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStrategy {
    /// One overall score with a short justification.
    #[default]
    Holistic,
    /// A score per rubric dimension.
    Dimensional,
    /// Holistic score anchored against reference examples.
    Calibrated,
}

impl EvaluationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStrategy::Holistic => "holistic",
            EvaluationStrategy::Dimensional => "dimensional",
            EvaluationStrategy::Calibrated => "calibrated",
        }
    }
}

impl std::fmt::Display for EvaluationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvaluationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "holistic" => Ok(EvaluationStrategy::Holistic),
            "dimensional" | "dimensions" => Ok(EvaluationStrategy::Dimensional),
            "calibrated" => Ok(EvaluationStrategy::Calibrated),
            other => Err(format!("Unknown evaluation strategy: {}", other)),
        }
    }
}
