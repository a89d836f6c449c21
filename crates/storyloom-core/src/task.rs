//! Task descriptor and state machine.
//!
//! A task is one node in the workflow DAG. The descriptor owns its state
//! machine: transitions are validated through [`TaskDescriptor::transition_to`]
//! and illegal edges fail with an Internal error, leaving the state unchanged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::TaskError;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for dependencies to be satisfied.
    Queued,
    /// All dependencies met, waiting for scheduler dispatch.
    Ready,
    /// Actively executing its stage on a worker.
    Running,
    /// Execution suspended; `paused_from` remembers the origin state.
    Paused,
    /// Canceled by user, cascade or timeout (terminal).
    Canceled,
    /// Stage execution error (terminal, retryable via Failed → Queued).
    Failed,
    /// Completed successfully (terminal).
    Succeeded,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "Queued",
            TaskState::Ready => "Ready",
            TaskState::Running => "Running",
            TaskState::Paused => "Paused",
            TaskState::Canceled => "Canceled",
            TaskState::Failed => "Failed",
            TaskState::Succeeded => "Succeeded",
        }
    }

    /// Terminal states admit no further transitions except the
    /// Failed → Queued retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Canceled | TaskState::Failed | TaskState::Succeeded
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task performs. The scheduler treats all kinds alike;
/// the workflow engine uses the kind to pick a stage from the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Storyboard generation from story text.
    Storyboard,
    /// Text-to-image generation for one scene.
    ImageGen,
    /// Image-to-video conversion.
    VideoClip,
    /// Text-to-speech synthesis.
    Tts,
    /// Final composition of all scene assets.
    Compose,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Storyboard => "Storyboard",
            TaskType::ImageGen => "ImageGen",
            TaskType::VideoClip => "VideoClip",
            TaskType::Tts => "TTS",
            TaskType::Compose => "Compose",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources a task claims while running. CPU slots gate admission hard;
/// RAM and VRAM are soft gates (see the scheduler's resource budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDemand {
    pub cpu_slots: i32,
    pub ram_mb: i32,
    pub vram_mb: i32,
}

impl Default for ResourceDemand {
    fn default() -> Self {
        Self {
            cpu_slots: 1,
            ram_mb: 0,
            vram_mb: 0,
        }
    }
}

impl ResourceDemand {
    pub fn new(cpu_slots: i32, ram_mb: i32, vram_mb: i32) -> Self {
        Self {
            cpu_slots,
            ram_mb,
            vram_mb,
        }
    }

    /// Floor the demand at the legal minimum: at least one cpu slot,
    /// non-negative memory.
    pub fn normalized(self) -> Self {
        Self {
            cpu_slots: self.cpu_slots.max(1),
            ram_mb: self.ram_mb.max(0),
            vram_mb: self.vram_mb.max(0),
        }
    }
}

/// Core data structure representing a single task in the system.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    /// Unique identifier within the scheduler instance.
    pub task_id: String,
    /// Workflow-level correlation id.
    pub trace_id: String,
    pub task_type: TaskType,
    pub state: TaskState,
    /// Higher wins ties; aging boosts the effective value while waiting.
    pub priority: i32,
    /// Completion fraction in [0, 1].
    pub progress: f32,
    pub resource_demand: ResourceDemand,
    /// Prerequisite task ids, in submission order.
    pub deps: Vec<String>,
    /// Initial input bag. Merged into the stage context before predecessor
    /// outputs; predecessor outputs overwrite seed keys on conflict.
    pub seed_inputs: HashMap<String, Value>,

    pub created_at: DateTime<Utc>,
    /// Set on the first transition to Running.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the first transition to a terminal state; cleared only by
    /// the Failed → Queued retry.
    pub finished_at: Option<DateTime<Utc>>,

    /// Populated on Failed/Canceled.
    pub error: Option<TaskError>,
    /// Shared with every task of the same workflow.
    pub cancel_token: Arc<CancelToken>,
    /// Present iff `state == Paused`; remembers where to resume to.
    pub paused_from: Option<TaskState>,
}

impl TaskDescriptor {
    pub fn new(task_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            trace_id: String::new(),
            task_type,
            state: TaskState::Queued,
            priority: 0,
            progress: 0.0,
            resource_demand: ResourceDemand::default(),
            deps: Vec::new(),
            seed_inputs: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            cancel_token: CancelToken::new(),
            paused_from: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.deps = deps;
        self
    }

    pub fn with_resource_demand(mut self, demand: ResourceDemand) -> Self {
        self.resource_demand = demand;
        self
    }

    pub fn with_cancel_token(mut self, token: Arc<CancelToken>) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_seed_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.seed_inputs.insert(key.into(), value);
        self
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attempt a state transition. Illegal edges return an Internal error
    /// and leave every field untouched.
    ///
    /// Legal transitions:
    ///   Queued  → Ready, Paused, Canceled
    ///   Ready   → Running, Paused, Canceled
    ///   Running → Paused, Succeeded, Failed, Canceled
    ///   Paused  → Running, Ready, Queued, Canceled
    ///   Failed  → Queued  (retry)
    pub fn transition_to(&mut self, new_state: TaskState) -> Result<(), TaskError> {
        use TaskState::*;

        let legal = match self.state {
            Queued => matches!(new_state, Ready | Paused | Canceled),
            Ready => matches!(new_state, Running | Paused | Canceled),
            Running => matches!(new_state, Paused | Succeeded | Failed | Canceled),
            Paused => matches!(new_state, Running | Ready | Queued | Canceled),
            Failed => matches!(new_state, Queued),
            Canceled | Succeeded => false,
        };

        if !legal {
            return Err(TaskError::internal(format!(
                "Illegal state transition: {} -> {} (task_id={})",
                self.state, new_state, self.task_id
            )));
        }

        let old_state = self.state;
        self.state = new_state;

        if new_state == Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }

        if new_state == Paused {
            self.paused_from = Some(old_state);
        } else if old_state == Paused {
            self.paused_from = None;
        }

        // Retry resets the task to an indistinguishable-from-fresh run.
        if old_state == Failed && new_state == Queued {
            self.progress = 0.0;
            self.error = None;
            self.started_at = None;
            self.finished_at = None;
        }

        Ok(())
    }

    /// Set progress, clamped to [0, 1].
    pub fn set_progress(&mut self, progress: f32) {
        self.progress = progress.clamp(0.0, 1.0);
    }
}
