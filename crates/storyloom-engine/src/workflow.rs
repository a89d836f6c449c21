//! Workflow engine.
//!
//! Turns one user request (story text, style, scene count) into a task
//! graph — one Storyboard task, N ImageGen tasks fanned out behind it, one
//! Compose task joining them — submits it to the scheduler, and aggregates
//! per-task state changes into workflow-level progress and completion.
//!
//! The engine never executes work itself and fabricates no artifacts: the
//! final output path is read from the Compose task's outputs.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use storyloom_core::{
    CancelToken, Logger, Scheduler, Stage, StageContext, TaskDescriptor, TaskError, TaskState,
    TaskType,
};

use crate::config::EngineConfig;
use crate::stages::mock_stage_factory;

const COMPONENT: &str = "workflow";

const STORYBOARD_PRIORITY: i32 = 100;
const IMAGE_GEN_PRIORITY: i32 = 50;
const COMPOSE_PRIORITY: i32 = 10;

/// Per-task progress callback: `(trace_id, task_id, state, progress)`.
pub type ProgressCallback = Arc<dyn Fn(&str, &str, TaskState, f32) + Send + Sync>;

/// Workflow completion callback: `(trace_id, success, output_path)`.
/// `output_path` is empty on failure.
pub type CompletionCallback = Arc<dyn Fn(&str, bool, &str) + Send + Sync>;

/// Pluggable stage factory. The engine holds no knowledge of what a stage
/// actually does.
pub type StageFactory = Arc<dyn Fn(TaskType) -> Arc<dyn Stage> + Send + Sync>;

/// Wraps the Compose stage so the engine can read `output_path` from its
/// output bag once the workflow succeeds.
struct CaptureOutputPath {
    inner: Arc<dyn Stage>,
    slot: Arc<Mutex<Option<String>>>,
}

impl Stage for CaptureOutputPath {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute(&self, ctx: &mut StageContext) -> Result<(), TaskError> {
        self.inner.execute(ctx)?;
        if let Some(path) = ctx.output("output_path").and_then(|v| v.as_str()) {
            *self.slot.lock() = Some(path.to_string());
        }
        Ok(())
    }
}

/// Bookkeeping for one active workflow.
struct WorkflowState {
    trace_id: String,
    task_ids: Vec<String>,
    terminal: HashSet<String>,
    completed: usize,
    total: usize,
    failed: bool,
    completion_emitted: bool,
    output_path: Arc<Mutex<Option<String>>>,
}

#[derive(Default)]
struct EngineState {
    workflows: Vec<WorkflowState>,
    progress_cb: Option<ProgressCallback>,
    completion_cb: Option<CompletionCallback>,
    stage_factory: Option<StageFactory>,
}

/// Orchestrates the creation and submission of a linked task graph for a
/// single story-to-video workflow, and reports its progress.
pub struct WorkflowEngine {
    scheduler: Arc<dyn Scheduler>,
    logger: Arc<dyn Logger>,
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl WorkflowEngine {
    pub fn new(scheduler: Arc<dyn Scheduler>, logger: Arc<dyn Logger>) -> Arc<Self> {
        Self::with_config(scheduler, logger, EngineConfig::default())
    }

    pub fn with_config(
        scheduler: Arc<dyn Scheduler>,
        logger: Arc<dyn Logger>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            scheduler,
            logger,
            config,
            state: Mutex::new(EngineState::default()),
        });

        // Subscribe once; the engine outlives the subscription via Weak so
        // a dropped engine stops reacting without unsubscription plumbing.
        let weak: Weak<Self> = Arc::downgrade(&engine);
        engine
            .scheduler
            .on_state_change(Arc::new(move |task_id, state, progress| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_state_change(task_id, state, progress);
                }
            }));

        engine
    }

    /// Register a callback for workflow completion.
    pub fn on_completion(&self, cb: CompletionCallback) {
        self.state.lock().completion_cb = Some(cb);
    }

    /// Register a callback for per-task progress updates.
    pub fn on_progress(&self, cb: ProgressCallback) {
        self.state.lock().progress_cb = Some(cb);
    }

    /// Swap the stage factory (defaults to the built-in mock stages).
    pub fn set_stage_factory(&self, factory: StageFactory) {
        self.state.lock().stage_factory = Some(factory);
    }

    /// Start a new workflow: Storyboard → ImageGen×N → Compose.
    ///
    /// Submission is sequential; if any submit fails, every already
    /// submitted task of the workflow is canceled and the error returned.
    /// Returns the workflow trace id.
    pub fn start_workflow(
        &self,
        story_text: &str,
        style: &str,
        scene_count: i32,
    ) -> Result<String, TaskError> {
        let scene_count = if scene_count > 0 {
            scene_count
        } else {
            self.config.default_scene_count
        };
        let trace_id = Uuid::new_v4().to_string();

        self.logger.info(
            &trace_id,
            COMPONENT,
            "workflow_start",
            &format!("scenes={scene_count} style={style}"),
        );

        // One cancel token shared by every task of the workflow.
        let workflow_cancel = CancelToken::new();
        let output_path = Arc::new(Mutex::new(None));

        let storyboard_id = Uuid::new_v4().to_string();
        let image_ids: Vec<String> = (0..scene_count)
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        let compose_id = Uuid::new_v4().to_string();

        let mut task_ids = vec![storyboard_id.clone()];
        task_ids.extend(image_ids.iter().cloned());
        task_ids.push(compose_id.clone());
        let total = task_ids.len();

        let factory = {
            let state = self.state.lock();
            state.stage_factory.clone()
        };
        let make_stage =
            |task_type: TaskType| -> Arc<dyn Stage> {
                match &factory {
                    Some(factory) => factory(task_type),
                    None => mock_stage_factory(task_type),
                }
            };

        // Register the workflow before submitting anything: tasks may start
        // (and finish) the moment they are submitted, and their events must
        // find the owning workflow.
        self.state.lock().workflows.push(WorkflowState {
            trace_id: trace_id.clone(),
            task_ids: task_ids.clone(),
            terminal: HashSet::new(),
            completed: 0,
            total,
            failed: false,
            completion_emitted: false,
            output_path: Arc::clone(&output_path),
        });

        let mut submitted: Vec<String> = Vec::new();
        let mut submit_all = || -> Result<(), TaskError> {
            let storyboard = TaskDescriptor::new(storyboard_id.as_str(), TaskType::Storyboard)
                .with_trace_id(trace_id.as_str())
                .with_priority(STORYBOARD_PRIORITY)
                .with_resource_demand(self.config.demand_for(TaskType::Storyboard))
                .with_cancel_token(Arc::clone(&workflow_cancel))
                .with_seed_input("story_text", json!(story_text))
                .with_seed_input("style", json!(style))
                .with_seed_input("scene_count", json!(scene_count));
            self.scheduler
                .submit(storyboard, make_stage(TaskType::Storyboard))?;
            submitted.push(storyboard_id.clone());

            for (index, image_id) in image_ids.iter().enumerate() {
                let image = TaskDescriptor::new(image_id.as_str(), TaskType::ImageGen)
                    .with_trace_id(trace_id.as_str())
                    .with_priority(IMAGE_GEN_PRIORITY)
                    .with_deps(vec![storyboard_id.clone()])
                    .with_resource_demand(self.config.demand_for(TaskType::ImageGen))
                    .with_cancel_token(Arc::clone(&workflow_cancel))
                    .with_seed_input("scene_index", json!(index as i64));
                self.scheduler.submit(image, make_stage(TaskType::ImageGen))?;
                submitted.push(image_id.clone());
            }

            let compose = TaskDescriptor::new(compose_id.as_str(), TaskType::Compose)
                .with_trace_id(trace_id.as_str())
                .with_priority(COMPOSE_PRIORITY)
                .with_deps(image_ids.clone())
                .with_resource_demand(self.config.demand_for(TaskType::Compose))
                .with_cancel_token(Arc::clone(&workflow_cancel));
            let compose_stage = Arc::new(CaptureOutputPath {
                inner: make_stage(TaskType::Compose),
                slot: Arc::clone(&output_path),
            });
            self.scheduler.submit(compose, compose_stage)?;
            submitted.push(compose_id.clone());
            Ok(())
        };

        if let Err(err) = submit_all() {
            self.logger.error(
                &trace_id,
                COMPONENT,
                "workflow_submit_failed",
                &format!("rolling back {} submitted tasks: {err}", submitted.len()),
            );
            for task_id in &submitted {
                let _ = self.scheduler.cancel(task_id);
            }
            self.state
                .lock()
                .workflows
                .retain(|wf| wf.trace_id != trace_id);
            return Err(err);
        }

        self.logger.info(
            &trace_id,
            COMPONENT,
            "workflow_created",
            &format!("tasks created: {total} (1 storyboard + {scene_count} images + 1 compose)"),
        );

        Ok(trace_id)
    }

    /// Cancel an entire workflow by trace id. Best-effort per task.
    pub fn cancel_workflow(&self, trace_id: &str) -> Result<(), TaskError> {
        let task_ids = {
            let state = self.state.lock();
            let Some(wf) = state.workflows.iter().find(|wf| wf.trace_id == trace_id) else {
                return Err(TaskError::internal(format!("Workflow not found: {trace_id}")));
            };
            wf.task_ids.clone()
        };

        self.logger
            .info(trace_id, COMPONENT, "workflow_cancel", "canceling workflow");

        for task_id in &task_ids {
            let _ = self.scheduler.cancel(task_id);
        }
        Ok(())
    }

    fn handle_state_change(&self, task_id: &str, state: TaskState, progress: f32) {
        let mut forward: Option<(ProgressCallback, String)> = None;
        let mut completion: Option<(CompletionCallback, String, bool, String)> = None;

        {
            let mut engine_state = self.state.lock();
            let progress_cb = engine_state.progress_cb.clone();
            let completion_cb = engine_state.completion_cb.clone();

            let Some(wf) = engine_state
                .workflows
                .iter_mut()
                .find(|wf| wf.task_ids.iter().any(|id| id == task_id))
            else {
                return;
            };

            if let Some(cb) = progress_cb {
                forward = Some((cb, wf.trace_id.clone()));
            }

            match state {
                TaskState::Succeeded => {
                    if wf.terminal.insert(task_id.to_string()) {
                        wf.completed += 1;
                    }
                }
                TaskState::Failed | TaskState::Canceled => {
                    wf.terminal.insert(task_id.to_string());
                    wf.failed = true;
                }
                _ => {}
            }

            if !wf.completion_emitted {
                if wf.completed == wf.total {
                    wf.completion_emitted = true;
                    let path = wf.output_path.lock().clone().unwrap_or_default();
                    if let Some(cb) = completion_cb {
                        completion = Some((cb, wf.trace_id.clone(), true, path));
                    }
                } else if wf.failed && wf.terminal.len() == wf.total {
                    wf.completion_emitted = true;
                    if let Some(cb) = completion_cb {
                        completion = Some((cb, wf.trace_id.clone(), false, String::new()));
                    }
                }
            }
        }

        // Callbacks run with no engine lock held; they may call back into
        // the engine or the scheduler.
        if let Some((cb, trace_id)) = forward {
            cb(&trace_id, task_id, state, progress);
        }
        if let Some((cb, trace_id, success, path)) = completion {
            if success {
                self.logger.info(
                    &trace_id,
                    COMPONENT,
                    "workflow_completed",
                    &format!("all tasks succeeded, output: {path}"),
                );
            } else {
                self.logger.warn(
                    &trace_id,
                    COMPONENT,
                    "workflow_failed",
                    "workflow finished with failed or canceled tasks",
                );
            }
            cb(&trace_id, success, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storyloom_core::{NullLogger, StateCallback};

    /// Records submissions and replays state changes on demand; stands in
    /// for the real scheduler behind the trait seam.
    #[derive(Default)]
    struct RecordingScheduler {
        fail_submit_after: Option<usize>,
        submitted: Mutex<Vec<TaskDescriptor>>,
        canceled: Mutex<Vec<String>>,
        callbacks: Mutex<Vec<StateCallback>>,
    }

    impl RecordingScheduler {
        fn failing_after(count: usize) -> Self {
            Self {
                fail_submit_after: Some(count),
                ..Self::default()
            }
        }

        fn fire(&self, task_id: &str, state: TaskState, progress: f32) {
            let callbacks = self.callbacks.lock().clone();
            for cb in callbacks {
                cb(task_id, state, progress);
            }
        }

        fn submitted_ids(&self) -> Vec<String> {
            self.submitted
                .lock()
                .iter()
                .map(|task| task.task_id.clone())
                .collect()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn submit(&self, task: TaskDescriptor, _stage: Arc<dyn Stage>) -> Result<(), TaskError> {
            let mut submitted = self.submitted.lock();
            if let Some(limit) = self.fail_submit_after {
                if submitted.len() >= limit {
                    return Err(TaskError::internal("injected submit failure"));
                }
            }
            submitted.push(task);
            Ok(())
        }

        fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
            self.canceled.lock().push(task_id.to_string());
            Ok(())
        }

        fn pause(&self, _task_id: &str) -> Result<(), TaskError> {
            Ok(())
        }

        fn resume(&self, _task_id: &str) -> Result<(), TaskError> {
            Ok(())
        }

        fn on_state_change(&self, cb: StateCallback) {
            self.callbacks.lock().push(cb);
        }

        fn tick(&self) {}

        fn has_pending_tasks(&self) -> bool {
            false
        }
    }

    fn engine_over(scheduler: Arc<RecordingScheduler>) -> Arc<WorkflowEngine> {
        WorkflowEngine::new(scheduler, Arc::new(NullLogger))
    }

    #[test]
    fn test_start_workflow_builds_expected_graph() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let trace_id = engine.start_workflow("story", "style", 3).unwrap();
        assert!(!trace_id.is_empty());

        let submitted = scheduler.submitted.lock();
        assert_eq!(submitted.len(), 5); // 1 storyboard + 3 images + 1 compose

        let storyboard = &submitted[0];
        assert_eq!(storyboard.task_type, TaskType::Storyboard);
        assert_eq!(storyboard.priority, STORYBOARD_PRIORITY);
        assert!(storyboard.deps.is_empty());
        assert_eq!(
            storyboard.seed_inputs.get("scene_count").and_then(|v| v.as_i64()),
            Some(3)
        );

        for (index, image) in submitted[1..4].iter().enumerate() {
            assert_eq!(image.task_type, TaskType::ImageGen);
            assert_eq!(image.priority, IMAGE_GEN_PRIORITY);
            assert_eq!(image.deps, vec![storyboard.task_id.clone()]);
            assert_eq!(
                image.seed_inputs.get("scene_index").and_then(|v| v.as_i64()),
                Some(index as i64)
            );
            assert_eq!(image.trace_id, trace_id);
        }

        let compose = &submitted[4];
        assert_eq!(compose.task_type, TaskType::Compose);
        assert_eq!(compose.priority, COMPOSE_PRIORITY);
        assert_eq!(compose.deps.len(), 3);

        // Every task shares the workflow cancel token.
        let token = Arc::clone(&storyboard.cancel_token);
        for task in submitted.iter() {
            assert!(Arc::ptr_eq(&token, &task.cancel_token));
        }
    }

    #[test]
    fn test_start_workflow_rolls_back_on_submit_failure() {
        let scheduler = Arc::new(RecordingScheduler::failing_after(2));
        let engine = engine_over(Arc::clone(&scheduler));

        let err = engine
            .start_workflow("story", "style", 3)
            .expect_err("injected failure");
        assert_eq!(err.category, storyloom_core::ErrorCategory::Internal);

        // Both successfully submitted tasks were canceled and the workflow
        // forgotten.
        let submitted = scheduler.submitted_ids();
        assert_eq!(submitted.len(), 2);
        let canceled = scheduler.canceled.lock().clone();
        assert_eq!(canceled, submitted);
        assert!(engine.cancel_workflow("whatever").is_err());
    }

    #[test]
    fn test_events_aggregate_into_success_completion() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let progress_events = Arc::new(AtomicUsize::new(0));
        let completions: Arc<Mutex<Vec<(String, bool, String)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let progress_count = Arc::clone(&progress_events);
        engine.on_progress(Arc::new(move |_, _, _, _| {
            progress_count.fetch_add(1, Ordering::SeqCst);
        }));
        let sink = Arc::clone(&completions);
        engine.on_completion(Arc::new(move |trace_id, success, path| {
            sink.lock()
                .push((trace_id.to_string(), success, path.to_string()));
        }));

        let trace_id = engine.start_workflow("story", "style", 2).unwrap();
        let ids = scheduler.submitted_ids();
        assert_eq!(ids.len(), 4);

        for id in &ids {
            scheduler.fire(id, TaskState::Running, 0.5);
            scheduler.fire(id, TaskState::Succeeded, 1.0);
        }

        let completions = completions.lock();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, trace_id);
        assert!(completions[0].1);
        assert_eq!(progress_events.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_failure_completion_emitted_once_when_all_terminal() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let completions: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        engine.on_completion(Arc::new(move |_, success, _| {
            sink.lock().push(success);
        }));

        engine.start_workflow("story", "style", 2).unwrap();
        let ids = scheduler.submitted_ids();

        // Storyboard fails; everything downstream is canceled by cascade.
        scheduler.fire(&ids[0], TaskState::Failed, 0.2);
        assert!(completions.lock().is_empty(), "not all terminal yet");

        for id in &ids[1..] {
            scheduler.fire(id, TaskState::Canceled, 0.0);
        }

        let completions = completions.lock();
        assert_eq!(*completions, vec![false]);
    }

    #[test]
    fn test_duplicate_terminal_events_do_not_double_count() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let completions = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&completions);
        engine.on_completion(Arc::new(move |_, _, _| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        engine.start_workflow("story", "style", 1).unwrap();
        let ids = scheduler.submitted_ids();
        assert_eq!(ids.len(), 3);

        // A repeated Succeeded event for the same task must not inflate the
        // completed counter into a premature completion.
        scheduler.fire(&ids[0], TaskState::Succeeded, 1.0);
        scheduler.fire(&ids[0], TaskState::Succeeded, 1.0);
        scheduler.fire(&ids[1], TaskState::Succeeded, 1.0);
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        scheduler.fire(&ids[2], TaskState::Succeeded, 1.0);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_workflow_cancels_every_task() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let trace_id = engine.start_workflow("story", "style", 2).unwrap();
        engine.cancel_workflow(&trace_id).unwrap();

        let canceled = scheduler.canceled.lock().clone();
        assert_eq!(canceled.len(), 4);
        assert_eq!(canceled, scheduler.submitted_ids());
    }

    #[test]
    fn test_cancel_unknown_workflow_fails() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(scheduler);
        assert!(engine.cancel_workflow("no-such-trace").is_err());
    }

    #[test]
    fn test_events_for_unknown_tasks_are_ignored() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_over(Arc::clone(&scheduler));

        let progress_events = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&progress_events);
        engine.on_progress(Arc::new(move |_, _, _, _| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        engine.start_workflow("story", "style", 1).unwrap();
        scheduler.fire("stranger", TaskState::Succeeded, 1.0);
        assert_eq!(progress_events.load(Ordering::SeqCst), 0);
    }
}
