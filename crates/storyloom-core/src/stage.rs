//! Stage abstraction — the executable body a task runs.
//!
//! A stage is a black box to the scheduler. It consumes a weakly-typed
//! input bag, emits an output bag under stable string keys, reports
//! progress through the context sink and honours the cancel token at
//! every natural checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::TaskError;

/// Sink invoked by a stage to report progress in [0, 1].
///
/// The scheduler's sink may block the calling thread when a cooperative
/// pause has been requested; stages must not assume the call returns
/// promptly.
pub type ProgressSink = Box<dyn Fn(f32) + Send + Sync>;

/// Execution context passed to a stage.
///
/// Inputs are populated by the scheduler before dispatch: the task's seed
/// inputs first, then every direct predecessor's last output bag (later
/// duplicates overwrite earlier ones). Outputs become the inputs of
/// successor tasks.
pub struct StageContext {
    pub trace_id: String,
    pub cancel_token: Arc<CancelToken>,
    inputs: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    progress_sink: Option<ProgressSink>,
}

impl StageContext {
    pub fn new(trace_id: impl Into<String>, cancel_token: Arc<CancelToken>) -> Self {
        Self {
            trace_id: trace_id.into(),
            cancel_token,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            progress_sink: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Insert one input entry; used by schedulers when wiring predecessor
    /// outputs into the context.
    pub fn insert_input(&mut self, key: impl Into<String>, value: Value) {
        self.inputs.insert(key.into(), value);
    }

    /// Raw input lookup.
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    pub fn input_str_or(&self, key: &str, default: &str) -> String {
        self.input_str(key).unwrap_or(default).to_string()
    }

    pub fn input_i64_or(&self, key: &str, default: i64) -> i64 {
        self.inputs
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn input_f64_or(&self, key: &str, default: f64) -> f64 {
        self.inputs
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Input interpreted as a list of strings; missing or mistyped entries
    /// yield an empty list.
    pub fn input_str_list(&self, key: &str) -> Vec<String> {
        self.inputs
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record one output entry under a stable string key.
    pub fn set_output(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(key.into(), value.into());
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// Consume the context, yielding the output bag.
    pub fn into_outputs(self) -> HashMap<String, Value> {
        self.outputs
    }

    /// Report progress in [0, 1]. No-op when the dispatcher attached no sink.
    pub fn report_progress(&self, progress: f32) {
        if let Some(sink) = &self.progress_sink {
            sink(progress.clamp(0.0, 1.0));
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("trace_id", &self.trace_id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// A unit of suspendable work.
///
/// Implementations MUST:
/// 1. Check the cancel token between sub-steps and at I/O boundaries, and
///    return a Canceled error promptly when observed.
/// 2. Emit monotonically non-decreasing progress values.
/// 3. Populate outputs under the stable keys the workflow engine documents.
///
/// Implementations MUST NOT mutate the task descriptor, block indefinitely
/// without cancel checks, or assume a fixed thread identity across calls.
pub trait Stage: Send + Sync {
    /// Human-readable name for logging (e.g. "MockStoryboard").
    fn name(&self) -> &str;

    /// Execute the stage with the given context.
    fn execute(&self, ctx: &mut StageContext) -> Result<(), TaskError>;
}
