//! Run controller.
//!
//! Ties the pieces together for one session over a run:
//!
//! 1. Resolve the run (create, or resume by id or run pointer)
//! 2. Take the run lock
//! 3. Loop: next batch, mark its trials in progress, execute concurrently,
//!    record each outcome as it finishes, pause
//! 4. Finalize once every trial is terminal
//!
//! A session can stop between batches (`max_batches`) without leaving the
//! registry in a state the next session cannot resume from.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trial_forge::controller::RunController;
//!
//! let controller = RunController::new(config, Arc::new(router));
//! let summary = controller.resume(None).await?;
//! std::process::exit(summary.exit_code());
//! ```

pub mod progress;
pub mod run;
pub mod summary;

pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use run::{ControllerError, ControllerOptions, NewRun, RunController};
pub use summary::{FailedTrial, RunOutcome, RunSummary, EXIT_FAILED_TO_START};
