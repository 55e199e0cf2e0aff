//! Durable run state.
//!
//! This module owns every file a run depends on for correct resumption:
//! - `registry`: per-trial identity, status, history and stage summaries
//! - `experiment`: the run record, run creation/resume/finalize and model additions
//! - `pointer`: the single "current run" record under the runs directory
//! - `lock`: the per-run operation lock
//!
//! Every mutation is persisted immediately through an atomic file replace, so
//! a crash leaves the state as of the last completed step.

pub mod experiment;
pub mod lock;
pub mod pointer;
pub mod registry;

pub use experiment::{
    enumerate_trials, ExperimentState, Run, RunPlan, RunStatus, RunStore, STATE_DIRNAME,
};
pub use lock::RunLock;
pub use pointer::RunPointer;
pub use registry::{
    format_trial_id, LayerSummary, RegistryEntry, StatusCounts, StatusTransition, TrialIdentity,
    TrialRegistry, TrialStatus,
};
