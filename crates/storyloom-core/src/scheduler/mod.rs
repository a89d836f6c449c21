//! Scheduler abstraction and configuration.
//!
//! The scheduler owns the task lifecycle from `submit` onward. Notification
//! is callback-driven rather than future-blocking: workers are never
//! occupied waiting on dependencies, and pause/resume/cancel work without
//! thread interruption.
//!
//! Two implementations:
//! - [`ThreadPoolScheduler`] — the production scheduler: dependency graph,
//!   priority + aging dispatch, resource budgets, cooperative pause.
//! - [`SequentialScheduler`] — single-threaded, tick-driven; deterministic
//!   harness for engine-level tests.

mod sequential;
mod thread_pool;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::stage::Stage;
use crate::task::{TaskDescriptor, TaskState};

pub use sequential::SequentialScheduler;
pub use thread_pool::ThreadPoolScheduler;

/// Callback for task state changes: `(task_id, new_state, progress)`.
///
/// Invoked from the scheduler's execution context with no scheduler locks
/// held; callbacks may call back into the scheduler.
pub type StateCallback = Arc<dyn Fn(&str, TaskState, f32) + Send + Sync>;

/// Manages task lifecycle and dispatch.
pub trait Scheduler: Send + Sync {
    /// Submit a task with its associated stage for execution.
    /// The scheduler owns the task lifecycle from this point.
    fn submit(&self, task: TaskDescriptor, stage: Arc<dyn Stage>) -> Result<(), TaskError>;

    /// Request cancellation of a task. Idempotent for already-canceled tasks.
    fn cancel(&self, task_id: &str) -> Result<(), TaskError>;

    /// Pause a task. Queued/Ready pause immediately; Running pauses
    /// cooperatively at the next progress checkpoint.
    fn pause(&self, task_id: &str) -> Result<(), TaskError>;

    /// Resume a paused task back to the state it was paused from.
    fn resume(&self, task_id: &str) -> Result<(), TaskError>;

    /// Register a callback for task state changes.
    fn on_state_change(&self, cb: StateCallback);

    /// Process pending housekeeping. Call periodically from an external
    /// driver (event loop or timer).
    fn tick(&self);

    /// True iff any known task is in a non-terminal state.
    fn has_pending_tasks(&self) -> bool;
}

/// Admission budgets. CPU slots are a hard gate; RAM and VRAM are soft
/// gates that may be bypassed only when nothing is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBudget {
    /// Hard ceiling on the summed cpu slots of running tasks.
    /// `<= 0` means "follow the worker count".
    pub cpu_slots_hard: i32,
    /// Soft RAM cap in MB; `<= 0` disables the gate.
    pub ram_soft_mb: i32,
    /// Soft VRAM cap in MB; `<= 0` disables the gate.
    pub vram_soft_mb: i32,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpu_slots_hard: 0,
            ram_soft_mb: 2048,
            vram_soft_mb: 7680,
        }
    }
}

/// Priority aging: a waiting task's effective priority grows by
/// `boost_per_interval` for every `interval_ms` spent in the ready-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingPolicy {
    pub interval_ms: i32,
    pub boost_per_interval: i32,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            boost_per_interval: 1,
        }
    }
}

/// Cooperative pause policy: a Running task that fails to reach a progress
/// checkpoint within the timeout is auto-canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PausePolicy {
    pub checkpoint_timeout_ms: i32,
}

impl Default for PausePolicy {
    fn default() -> Self {
        Self {
            checkpoint_timeout_ms: 1500,
        }
    }
}

/// Thread-pool scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size. `<= 0` selects automatically:
    /// clamp(hardware parallelism − 1, 2, 8).
    pub worker_count: i32,
    pub resource_budget: ResourceBudget,
    pub aging_policy: AgingPolicy,
    pub pause_policy: PausePolicy,
}

impl SchedulerConfig {
    /// Resolve auto values and floor every field at its legal minimum.
    pub fn normalized(mut self) -> Self {
        if self.worker_count <= 0 {
            self.worker_count = auto_worker_count();
        }
        if self.resource_budget.cpu_slots_hard <= 0 {
            self.resource_budget.cpu_slots_hard = self.worker_count;
        }
        self.resource_budget.ram_soft_mb = self.resource_budget.ram_soft_mb.max(0);
        self.resource_budget.vram_soft_mb = self.resource_budget.vram_soft_mb.max(0);

        if self.aging_policy.interval_ms <= 0 {
            self.aging_policy.interval_ms = AgingPolicy::default().interval_ms;
        }
        if self.aging_policy.boost_per_interval <= 0 {
            self.aging_policy.boost_per_interval = AgingPolicy::default().boost_per_interval;
        }
        if self.pause_policy.checkpoint_timeout_ms <= 0 {
            self.pause_policy.checkpoint_timeout_ms = PausePolicy::default().checkpoint_timeout_ms;
        }
        self
    }
}

fn auto_worker_count() -> i32 {
    let hw = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(0);
    if hw <= 0 {
        return 4;
    }
    (hw - 1).clamp(2, 8)
}
