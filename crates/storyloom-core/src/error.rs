//! Structured error taxonomy for task and scheduler operations.
//!
//! Errors are values: every fallible core operation returns
//! `Result<_, TaskError>`. The category enables programmatic branching
//! without string parsing; the numeric code is stable for telemetry
//! aggregation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error category for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// HTTP/connection failures surfaced by stages.
    Network,
    /// Deadline exceeded (e.g. pause checkpoint not reached in time).
    Timeout,
    /// Demand exceeds a hard resource budget.
    Resource,
    /// Stage execution logic error (invalid inputs, malformed responses).
    Pipeline,
    /// User or cascade cancellation.
    Canceled,
    /// Programming error or API misuse; never retryable.
    Internal,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Network",
            ErrorCategory::Timeout => "Timeout",
            ErrorCategory::Resource => "Resource",
            ErrorCategory::Pipeline => "Pipeline",
            ErrorCategory::Canceled => "Canceled",
            ErrorCategory::Internal => "Internal",
            ErrorCategory::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable numeric error codes.
pub mod code {
    pub const CANCELED: i32 = 1;
    pub const TIMEOUT: i32 = 2;
    pub const PIPELINE: i32 = 3;
    pub const INTERNAL: i32 = 4;

    /// Submit rejected: cpu demand exceeds the hard CPU budget.
    pub const CPU_OVER_BUDGET: i32 = 3001;
    /// Submit-time cancel: a dependency was already terminal and not succeeded.
    pub const DEPENDENCY_BLOCKED: i32 = 3002;
    /// Pause checkpoint not reached before the deadline; task auto-canceled.
    pub const PAUSE_TIMEOUT: i32 = 3003;
    /// Cascade cancel: an ancestor task failed or was canceled.
    pub const DEPENDENCY_CASCADE: i32 = 3004;
}

/// Structured error for all task/pipeline operations.
///
/// `message` is user-facing; `internal_message` carries the diagnostic
/// detail; `details` holds structured context such as `dependency_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{category}({code}): {message}")]
pub struct TaskError {
    pub category: ErrorCategory,
    pub code: i32,
    pub retryable: bool,
    pub message: String,
    #[serde(default)]
    pub internal_message: String,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl TaskError {
    pub fn new(
        category: ErrorCategory,
        code: i32,
        retryable: bool,
        message: impl Into<String>,
        internal_message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            retryable,
            message: message.into(),
            internal_message: internal_message.into(),
            details: HashMap::new(),
        }
    }

    /// Attach a structured detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Override the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn canceled() -> Self {
        Self::new(
            ErrorCategory::Canceled,
            code::CANCELED,
            false,
            "Operation canceled",
            "",
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, code::TIMEOUT, false, message, "")
    }

    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Pipeline, code::PIPELINE, false, message, "")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code::INTERNAL, false, message, "")
    }

    pub fn network(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, true, message, "")
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::Resource,
            code::CPU_OVER_BUDGET,
            false,
            message,
            "",
        )
    }

    /// True when the error represents a cancellation.
    pub fn is_canceled(&self) -> bool {
        self.category == ErrorCategory::Canceled
    }
}
