//! Output-length budget escalation policy.

use serde::{Deserialize, Serialize};

/// Default first budget, in output tokens.
pub const DEFAULT_INITIAL_BUDGET: u32 = 2048;

/// Default budget ceiling, in output tokens.
pub const DEFAULT_BUDGET_CEILING: u32 = 16384;

/// Default number of escalations after the first attempt.
pub const DEFAULT_MAX_ESCALATIONS: u32 = 3;

/// Step function used to raise the output budget after a truncation.
///
/// Budgets multiply by `multiplier` until `ceiling`; at most
/// `max_escalations` raises are allowed per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub initial: u32,
    pub ceiling: u32,
    pub multiplier: u32,
    pub max_escalations: u32,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BUDGET,
            ceiling: DEFAULT_BUDGET_CEILING,
            multiplier: 2,
            max_escalations: DEFAULT_MAX_ESCALATIONS,
        }
    }
}

impl BudgetPolicy {
    pub fn new(initial: u32, ceiling: u32, max_escalations: u32) -> Self {
        Self {
            initial,
            ceiling,
            multiplier: 2,
            max_escalations,
        }
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Checks that the policy can make progress.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial == 0 {
            return Err("initial budget must be positive".to_string());
        }
        if self.ceiling < self.initial {
            return Err(format!(
                "budget ceiling {} is below initial budget {}",
                self.ceiling, self.initial
            ));
        }
        if self.multiplier < 2 {
            return Err("budget multiplier must be at least 2".to_string());
        }
        Ok(())
    }

    /// Next budget after `current`. Strictly larger until the ceiling, then
    /// the ceiling itself.
    pub fn next_budget(&self, current: u32) -> u32 {
        if current >= self.ceiling {
            return self.ceiling;
        }
        current
            .saturating_mul(self.multiplier.max(2))
            .max(current.saturating_add(1))
            .min(self.ceiling)
    }

    /// Whether another escalation is allowed after `escalations` raises,
    /// with `current` in effect.
    pub fn can_escalate(&self, current: u32, escalations: u32) -> bool {
        escalations < self.max_escalations && current < self.ceiling
    }

    /// Every budget the policy will try, first to last.
    pub fn schedule(&self) -> Vec<u32> {
        let mut budgets = vec![self.initial];
        let mut current = self.initial;
        let mut escalations = 0;
        while self.can_escalate(current, escalations) {
            current = self.next_budget(current);
            escalations += 1;
            budgets.push(current);
        }
        budgets
    }
}
