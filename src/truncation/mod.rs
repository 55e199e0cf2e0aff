//! Truncation detection and adaptive output budgets.
//!
//! Providers cut responses off at the output-token budget without always
//! saying so. This module decides whether a response was cut off
//! ([`detector`]), computes the next, larger budget to retry with
//! ([`budget`]), and bounds the number of escalations with a small explicit
//! state machine ([`retry`]) that can be exercised without any I/O.

pub mod budget;
pub mod detector;
pub mod retry;

pub use budget::BudgetPolicy;
pub use detector::{detect, is_truncated, TruncationReason, TruncationVerdict};
pub use retry::{RetryState, TruncationRetry};
