//! Per-evaluation resource budget.
//!
//! Every rule evaluation acquires a CPU-time budget and a memory ceiling at
//! entry; both are checked cooperatively at AST boundaries and charged when
//! the capability layer hands out defensive copies. The scope releases on
//! every exit path because release lives in `Drop`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;

use crate::config::RuleConfig;

/// Why an evaluation was aborted.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EvalAbort {
    #[error("CPU budget exceeded: {elapsed_ms}ms > {budget_ms}ms")]
    CpuBudgetExceeded { elapsed_ms: u64, budget_ms: u64 },

    #[error("memory ceiling exceeded: requested {requested} bytes, limit {limit}, used {used}")]
    MemoryCeilingExceeded {
        requested: u64,
        limit: u64,
        used: u64,
    },
}

impl EvalAbort {
    /// The operation name recorded in the audit trail.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::CpuBudgetExceeded { .. } => "budget.cpu_exceeded",
            Self::MemoryCeilingExceeded { .. } => "budget.memory_exceeded",
        }
    }
}

/// Budget state shared between the walker and the capability layer.
#[derive(Debug)]
pub struct EvalBudget {
    started: Instant,
    cpu_budget: Duration,
    memory_ceiling: u64,
    memory_used: AtomicU64,
}

impl EvalBudget {
    pub fn start(config: &RuleConfig) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            cpu_budget: Duration::from_millis(config.cpu_budget_ms),
            memory_ceiling: config.memory_ceiling_bytes,
            memory_used: AtomicU64::new(0),
        })
    }

    /// Check the CPU-time budget. Called between AST nodes.
    pub fn check_time(&self) -> Result<(), EvalAbort> {
        let elapsed = self.started.elapsed();
        if elapsed > self.cpu_budget {
            return Err(EvalAbort::CpuBudgetExceeded {
                elapsed_ms: elapsed.as_millis() as u64,
                budget_ms: self.cpu_budget.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Charge bytes for a defensive copy handed to the expression.
    pub fn charge(&self, bytes: u64) -> Result<(), EvalAbort> {
        let used = self.memory_used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.memory_ceiling > 0 && used > self.memory_ceiling {
            return Err(EvalAbort::MemoryCeilingExceeded {
                requested: bytes,
                limit: self.memory_ceiling,
                used: used - bytes,
            });
        }
        Ok(())
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Records evaluation duration on release, whatever the exit path.
pub struct BudgetScope {
    budget: Arc<EvalBudget>,
}

impl BudgetScope {
    pub fn new(budget: Arc<EvalBudget>) -> Self {
        Self { budget }
    }
}

impl Drop for BudgetScope {
    fn drop(&mut self) {
        histogram!("betrace_rule_eval_seconds").record(self.budget.elapsed().as_secs_f64());
    }
}
