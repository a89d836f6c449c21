//! # Storyloom Core
//!
//! Core abstractions and deterministic logic for the Storyloom orchestration
//! runtime.
//!
//! This crate contains:
//! - Task descriptor, state machine and cancellation token
//! - Stage abstraction (unit of suspendable work with typed input/output bags)
//! - Scheduler trait plus the thread-pool and sequential implementations
//! - Structured error taxonomy and the logger sink contract
//!
//! This crate does NOT care about:
//! - What a stage actually does (HTTP calls, GPU inference, ffmpeg, ...)
//! - How progress is rendered to a user
//! - Where configuration comes from

pub mod cancel;
pub mod error;
pub mod logger;
pub mod scheduler;
pub mod stage;
pub mod task;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::error::{ErrorCategory, TaskError};
    pub use crate::logger::{Logger, NullLogger, TracingLogger};
    pub use crate::scheduler::{
        AgingPolicy, PausePolicy, ResourceBudget, Scheduler, SchedulerConfig,
        SequentialScheduler, StateCallback, ThreadPoolScheduler,
    };
    pub use crate::stage::{Stage, StageContext};
    pub use crate::task::{ResourceDemand, TaskDescriptor, TaskState, TaskType};
}

// Re-export key types at crate root
pub use cancel::CancelToken;
pub use error::{ErrorCategory, TaskError};
pub use logger::{Logger, NullLogger, TracingLogger};
pub use scheduler::{
    AgingPolicy, PausePolicy, ResourceBudget, Scheduler, SchedulerConfig, SequentialScheduler,
    StateCallback, ThreadPoolScheduler,
};
pub use stage::{Stage, StageContext};
pub use task::{ResourceDemand, TaskDescriptor, TaskState, TaskType};
