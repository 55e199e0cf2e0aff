//! Layer pipeline: per-trial execution of the context, generation and
//! evaluation stages.
//!
//! # Components
//!
//! - **Config**: the experiment definition and engine knobs
//! - **Prompts**: default templates and `{placeholder}` rendering
//! - **Artifacts**: raw and parsed per-layer files plus the call audit log
//! - **Executor**: drives a trial through its stages
//!
//! # Run Directory Layout
//!
//! ```text
//! runs/<run_id>/
//! ├── state/
//! │   ├── experiment.json
//! │   ├── definition.json
//! │   └── registry.json
//! ├── stage_a_context/
//! │   ├── trial_001.raw.1.txt
//! │   └── trial_001.json
//! ├── stage_b_generation/
//! │   ├── trial_001.raw.1.txt
//! │   ├── trial_001.raw.2.txt      (after a budget escalation)
//! │   └── trial_001.json
//! ├── stage_c_evaluation/
//! │   ├── trial_001__eval_model.raw.1.txt
//! │   └── trial_001__eval_model.json
//! └── api_calls.jsonl
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trial_forge::pipeline::{EngineConfig, ExperimentDefinition, PipelineExecutor};
//!
//! let (definition, _digest) = ExperimentDefinition::load(path)?;
//! let executor = PipelineExecutor::new(provider, EngineConfig::from_env()?, Arc::new(definition), run.dir());
//! let outcome = executor.run_trial(&identity).await?;
//! println!("{}: {}", outcome.trial_id, outcome.status);
//! ```

pub mod artifacts;
pub mod config;
pub mod executor;
pub mod prompts;

pub use artifacts::{
    ArtifactKey, ArtifactWriter, AuditLog, AuditRecord, LayerArtifact, StorageError,
    AUDIT_LOG_FILENAME, BYPASS_SENTINEL,
};
pub use config::{
    ConfigError, ContextSource, EngineConfig, ExperimentDefinition, Framework, PromptOverrides,
    Scenario,
};
pub use executor::{ExecutorError, PipelineExecutor, TrialOutcome};
