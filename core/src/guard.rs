/*
 * Copyright (c) 2026 the Vibe Engine developers.
 *
 * This file is part of the Vibe Script Engine.
 *
 * Licensed under the MIT License. See LICENSE for details.
 */

//! Per-run resource accounting. The guard is consulted before every
//! instruction and after every frame/stack push; breaching any limit ends
//! the run with a typed error.
//!
//! Cancellation is cooperative: a host that wants to stop a run early sets
//! a small remaining budget before the next invocation.

use crate::runtime::VmError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Per-run limits. Every field is independently configurable; the defaults
/// are generous for previews and tight enough to keep a runaway script from
/// wedging an editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub instruction_budget: u64,
    pub max_call_depth: usize,
    pub max_value_stack_depth: usize,
    pub wall_clock_limit: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            instruction_budget: 250_000,
            max_call_depth: 128,
            max_value_stack_depth: 2_048,
            wall_clock_limit: Duration::from_secs(1),
        }
    }
}

/// Counters for one run. Owned by a single VM instance; never shared.
#[derive(Debug)]
pub struct ResourceGuard {
    limits: ExecutionLimits,
    executed: u64,
    started: Instant,
}

impl ResourceGuard {
    pub fn new(limits: ExecutionLimits) -> Self {
        ResourceGuard { limits, executed: 0, started: Instant::now() }
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Called before every instruction: counts it, then checks budget and
    /// wall clock in that order.
    pub fn on_instruction(&mut self) -> Result<(), VmError> {
        self.executed += 1;
        if self.executed > self.limits.instruction_budget {
            return Err(VmError::InstructionBudgetExceeded(self.limits.instruction_budget));
        }
        if self.started.elapsed() > self.limits.wall_clock_limit {
            return Err(VmError::TimeLimitExceeded(self.limits.wall_clock_limit.as_millis()));
        }
        Ok(())
    }

    /// Called after pushing a user-function frame.
    pub fn ensure_call_depth(&self, depth: usize) -> Result<(), VmError> {
        if depth > self.limits.max_call_depth {
            return Err(VmError::CallDepthExceeded(self.limits.max_call_depth));
        }
        Ok(())
    }

    /// Called after every push onto the value stack.
    pub fn ensure_value_stack_depth(&self, depth: usize) -> Result<(), VmError> {
        if depth > self.limits.max_value_stack_depth {
            return Err(VmError::ValueStackExceeded(self.limits.max_value_stack_depth));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.instruction_budget, 250_000);
        assert_eq!(limits.max_call_depth, 128);
        assert_eq!(limits.max_value_stack_depth, 2_048);
        assert_eq!(limits.wall_clock_limit, Duration::from_secs(1));
    }

    #[test]
    fn test_budget_counts_and_trips() {
        let mut guard = ResourceGuard::new(ExecutionLimits {
            instruction_budget: 3,
            ..Default::default()
        });
        assert!(guard.on_instruction().is_ok());
        assert!(guard.on_instruction().is_ok());
        assert!(guard.on_instruction().is_ok());
        assert!(matches!(
            guard.on_instruction(),
            Err(VmError::InstructionBudgetExceeded(3))
        ));
        assert_eq!(guard.executed(), 4);
    }

    #[test]
    fn test_count_is_monotonic() {
        let mut guard = ResourceGuard::new(ExecutionLimits::default());
        let mut last = 0;
        for _ in 0..10 {
            guard.on_instruction().unwrap();
            assert_eq!(guard.executed(), last + 1);
            last = guard.executed();
        }
    }

    #[test]
    fn test_call_depth_limit() {
        let guard = ResourceGuard::new(ExecutionLimits {
            max_call_depth: 2,
            ..Default::default()
        });
        assert!(guard.ensure_call_depth(2).is_ok());
        assert!(matches!(
            guard.ensure_call_depth(3),
            Err(VmError::CallDepthExceeded(2))
        ));
    }

    #[test]
    fn test_value_stack_limit() {
        let guard = ResourceGuard::new(ExecutionLimits {
            max_value_stack_depth: 4,
            ..Default::default()
        });
        assert!(guard.ensure_value_stack_depth(4).is_ok());
        assert!(matches!(
            guard.ensure_value_stack_depth(5),
            Err(VmError::ValueStackExceeded(4))
        ));
    }

    #[test]
    fn test_wall_clock_trips() {
        let mut guard = ResourceGuard::new(ExecutionLimits {
            wall_clock_limit: Duration::from_millis(0),
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            guard.on_instruction(),
            Err(VmError::TimeLimitExceeded(0))
        ));
    }
}
