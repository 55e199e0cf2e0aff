//! Bounded truncation retry as an explicit state machine.
//!
//! ```text
//! Attempting(b0) --complete--> Accepted(b0)
//!      |
//!  truncated
//!      v
//! Truncated(b0) --budget left--> Attempting(b1) --> ...
//!      |
//!  no budget left
//!      v
//! Exhausted(bn)
//! ```
//!
//! The machine does no I/O: the pipeline executor performs one provider call
//! per `Attempting` state and feeds the detector verdict back in through
//! [`TruncationRetry::observe`].

use serde::{Deserialize, Serialize};

use super::budget::BudgetPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetryState {
    /// A call should be made with `budget`.
    Attempting { budget: u32, escalation: u32 },
    /// The call at `budget` was cut off. Transient; resolved by `observe`.
    Truncated { budget: u32, escalation: u32 },
    /// The response at `budget` is final.
    Accepted { budget: u32, escalation: u32 },
    /// Truncated at the last allowed budget.
    Exhausted { budget: u32, escalation: u32 },
}

impl RetryState {
    pub fn budget(&self) -> u32 {
        match *self {
            RetryState::Attempting { budget, .. }
            | RetryState::Truncated { budget, .. }
            | RetryState::Accepted { budget, .. }
            | RetryState::Exhausted { budget, .. } => budget,
        }
    }

    pub fn escalation(&self) -> u32 {
        match *self {
            RetryState::Attempting { escalation, .. }
            | RetryState::Truncated { escalation, .. }
            | RetryState::Accepted { escalation, .. }
            | RetryState::Exhausted { escalation, .. } => escalation,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Accepted { .. } | RetryState::Exhausted { .. }
        )
    }
}

/// Drives one call site through budget escalation.
#[derive(Debug, Clone)]
pub struct TruncationRetry {
    policy: BudgetPolicy,
    state: RetryState,
    trail: Vec<RetryState>,
}

impl TruncationRetry {
    pub fn new(policy: BudgetPolicy) -> Self {
        let state = RetryState::Attempting {
            budget: policy.initial,
            escalation: 0,
        };
        Self {
            policy,
            state,
            trail: vec![state],
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Budget for the pending or last call.
    pub fn budget(&self) -> u32 {
        self.state.budget()
    }

    /// Number of provider calls made so far.
    pub fn attempts(&self) -> u32 {
        self.state.escalation() + 1
    }

    /// Every state visited, in order.
    pub fn trail(&self) -> &[RetryState] {
        &self.trail
    }

    /// Feeds the verdict for the call made in the current `Attempting` state
    /// and returns the resulting state.
    ///
    /// Observing in a terminal state is a no-op.
    pub fn observe(&mut self, truncated: bool) -> RetryState {
        let RetryState::Attempting { budget, escalation } = self.state else {
            return self.state;
        };

        if !truncated {
            self.transition(RetryState::Accepted { budget, escalation });
            return self.state;
        }

        self.transition(RetryState::Truncated { budget, escalation });
        let next = if self.policy.can_escalate(budget, escalation) {
            RetryState::Attempting {
                budget: self.policy.next_budget(budget),
                escalation: escalation + 1,
            }
        } else {
            RetryState::Exhausted { budget, escalation }
        };
        self.transition(next);
        self.state
    }

    fn transition(&mut self, next: RetryState) {
        self.state = next;
        self.trail.push(next);
    }
}
