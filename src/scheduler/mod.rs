//! Rate-limit-aware batch scheduling.
//!
//! Pending trials are partitioned by model and interleaved round-robin so a
//! batch never carries more than the configured number of trials for any one
//! model. Batches run one after another with a pause in between, which gives
//! provider-side rate-limit windows time to reset.
//!
//! ```text
//!  pending:  m1 m1 m1 | m2 m2 | m3
//!  batch 1:  m1 m2 m3
//!  batch 2:  m1 m2
//!  batch 3:  m1
//! ```

pub mod batching;

pub use batching::{Batch, BatchScheduler};
