//! trial-forge: resumable multi-model trial orchestration.
//!
//! Runs every scenario × framework × model combination of an experiment
//! through a three-stage LLM pipeline (context, generation, evaluation),
//! persisting raw and parsed output of every call so that a killed run
//! resumes without repeating completed work.

// Core modules
pub mod cli;
pub mod controller;
pub mod error;
pub mod llm;
pub mod parser;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod truncation;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use controller::{RunController, RunOutcome, RunSummary};
pub use error::{LlmError, ProviderErrorKind, StageError, StageFailureReason, StateError};
pub use pipeline::{EngineConfig, ExperimentDefinition, PipelineExecutor, TrialOutcome};
pub use state::{TrialIdentity, TrialRegistry, TrialStatus};
pub use types::{EvaluationStrategy, ParseStatus, Stage};
