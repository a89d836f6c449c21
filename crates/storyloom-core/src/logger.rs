//! Logger sink contract.
//!
//! Core components log through this trait; concrete backends live outside
//! the core. The contract is infallible by design — implementations
//! swallow their own errors, and callers never react to logging problems.

/// Structured logging sink keyed by workflow trace id.
pub trait Logger: Send + Sync {
    fn info(&self, trace_id: &str, component: &str, event: &str, message: &str);
    fn warn(&self, trace_id: &str, component: &str, event: &str, message: &str);
    fn error(&self, trace_id: &str, component: &str, event: &str, message: &str);
}

/// Forwards to the `tracing` macros with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, trace_id: &str, component: &str, event: &str, message: &str) {
        tracing::info!(trace_id = %trace_id, component = %component, event = %event, "{message}");
    }

    fn warn(&self, trace_id: &str, component: &str, event: &str, message: &str) {
        tracing::warn!(trace_id = %trace_id, component = %component, event = %event, "{message}");
    }

    fn error(&self, trace_id: &str, component: &str, event: &str, message: &str) {
        tracing::error!(trace_id = %trace_id, component = %component, event = %event, "{message}");
    }
}

/// Discards everything; for tests and benchmarks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn info(&self, _trace_id: &str, _component: &str, _event: &str, _message: &str) {}
    fn warn(&self, _trace_id: &str, _component: &str, _event: &str, _message: &str) {}
    fn error(&self, _trace_id: &str, _component: &str, _event: &str, _message: &str) {}
}
