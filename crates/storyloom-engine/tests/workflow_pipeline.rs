//! End-to-end workflow scenarios over the real schedulers.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use storyloom_core::{
    AgingPolicy, NullLogger, PausePolicy, ResourceBudget, Scheduler, SchedulerConfig,
    SequentialScheduler, Stage, StageContext, TaskError, TaskState, TaskType, ThreadPoolScheduler,
};
use storyloom_engine::{mock_stage_factory, WorkflowEngine};

fn pool_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_count: 2,
        resource_budget: ResourceBudget {
            cpu_slots_hard: 2,
            ram_soft_mb: 2048,
            vram_soft_mb: 7680,
        },
        aging_policy: AgingPolicy {
            interval_ms: 100,
            boost_per_interval: 1,
        },
        pause_policy: PausePolicy {
            checkpoint_timeout_ms: 500,
        },
    }
}

fn wait_until_idle(scheduler: &dyn Scheduler, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        scheduler.tick();
        if !scheduler.has_pending_tasks() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    !scheduler.has_pending_tasks()
}

fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Clone, Default)]
struct CompletionLog {
    completions: Arc<Mutex<Vec<(String, bool, String)>>>,
}

impl CompletionLog {
    fn attach(&self, engine: &WorkflowEngine) {
        let sink = Arc::clone(&self.completions);
        engine.on_completion(Arc::new(move |trace_id, success, path| {
            sink.lock()
                .push((trace_id.to_string(), success, path.to_string()));
        }));
    }

    fn first(&self) -> Option<(String, bool, String)> {
        self.completions.lock().first().cloned()
    }

    fn len(&self) -> usize {
        self.completions.lock().len()
    }
}

struct FailingStage;

impl Stage for FailingStage {
    fn name(&self) -> &str {
        "FailingStage"
    }

    fn execute(&self, _ctx: &mut StageContext) -> Result<(), TaskError> {
        Err(TaskError::pipeline("simulated stage failure"))
    }
}

#[test]
fn test_mock_workflow_succeeds_and_reports_compose_output() {
    let scheduler = Arc::new(ThreadPoolScheduler::new(pool_config(), Arc::new(NullLogger)));
    let engine = WorkflowEngine::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(NullLogger),
    );

    let log = CompletionLog::default();
    log.attach(&engine);

    let progress: Arc<Mutex<Vec<(String, TaskState, f32)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = Arc::clone(&progress);
    engine.on_progress(Arc::new(move |_, task_id, state, p| {
        progress_sink.lock().push((task_id.to_string(), state, p));
    }));

    let trace_id = engine
        .start_workflow("a fox crosses the river", "watercolor", 2)
        .unwrap();

    assert!(wait_until_idle(scheduler.as_ref(), Duration::from_secs(10)));
    let log_check = log.clone();
    assert!(wait_for(
        move || log_check.len() == 1,
        Duration::from_secs(2)
    ));

    let (completed_trace, success, output_path) = log.first().expect("one completion");
    assert_eq!(completed_trace, trace_id);
    assert!(success);
    assert_eq!(output_path, "/tmp/storyloom_mock/final_output.mp4");

    // Progress was forwarded per task and every task succeeded.
    let progress = progress.lock();
    let succeeded = progress
        .iter()
        .filter(|(_, state, _)| *state == TaskState::Succeeded)
        .count();
    assert_eq!(succeeded, 4); // storyboard + 2 images + compose
}

#[test]
fn test_failing_storyboard_fails_workflow_and_cascades() {
    let scheduler = Arc::new(ThreadPoolScheduler::new(pool_config(), Arc::new(NullLogger)));
    let engine = WorkflowEngine::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(NullLogger),
    );

    let log = CompletionLog::default();
    log.attach(&engine);

    // Storyboard fails; image and compose stages would succeed if reached.
    engine.set_stage_factory(Arc::new(|task_type: TaskType| -> Arc<dyn Stage> {
        match task_type {
            TaskType::Storyboard => Arc::new(FailingStage),
            other => mock_stage_factory(other),
        }
    }));

    engine.start_workflow("story", "style", 2).unwrap();

    assert!(wait_until_idle(scheduler.as_ref(), Duration::from_secs(5)));
    let log_check = log.clone();
    assert!(wait_for(
        move || log_check.len() == 1,
        Duration::from_secs(2)
    ));

    let (_, success, output_path) = log.first().expect("one completion");
    assert!(!success);
    assert!(output_path.is_empty());
}

#[test]
fn test_cancel_workflow_mid_flight_reports_failure() {
    let scheduler = Arc::new(ThreadPoolScheduler::new(pool_config(), Arc::new(NullLogger)));
    let engine = WorkflowEngine::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(NullLogger),
    );

    let log = CompletionLog::default();
    log.attach(&engine);

    let trace_id = engine.start_workflow("story", "style", 3).unwrap();

    // Let the storyboard get going, then pull the plug on everything.
    thread::sleep(Duration::from_millis(150));
    engine.cancel_workflow(&trace_id).unwrap();

    assert!(wait_until_idle(scheduler.as_ref(), Duration::from_secs(5)));
    let log_check = log.clone();
    assert!(wait_for(
        move || log_check.len() == 1,
        Duration::from_secs(2)
    ));

    let (completed_trace, success, _) = log.first().expect("one completion");
    assert_eq!(completed_trace, trace_id);
    assert!(!success);
}

#[test]
fn test_workflow_runs_deterministically_over_sequential_scheduler() {
    let scheduler = Arc::new(SequentialScheduler::new());
    let engine = WorkflowEngine::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(NullLogger),
    );

    let log = CompletionLog::default();
    log.attach(&engine);

    engine.start_workflow("story", "style", 2).unwrap();

    let mut guard = 0;
    while scheduler.has_pending_tasks() && guard < 32 {
        scheduler.tick();
        guard += 1;
    }

    assert!(!scheduler.has_pending_tasks());
    let (_, success, output_path) = log.first().expect("one completion");
    assert!(success);
    assert_eq!(output_path, "/tmp/storyloom_mock/final_output.mp4");
    assert_eq!(log.len(), 1);
}

#[test]
fn test_two_workflows_are_tracked_independently() {
    let scheduler = Arc::new(ThreadPoolScheduler::new(pool_config(), Arc::new(NullLogger)));
    let engine = WorkflowEngine::new(
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        Arc::new(NullLogger),
    );

    let log = CompletionLog::default();
    log.attach(&engine);

    let first = engine.start_workflow("one", "style", 1).unwrap();
    let second = engine.start_workflow("two", "style", 1).unwrap();
    assert_ne!(first, second);

    assert!(wait_until_idle(scheduler.as_ref(), Duration::from_secs(10)));
    let log_check = log.clone();
    assert!(wait_for(
        move || log_check.len() == 2,
        Duration::from_secs(2)
    ));

    let completions = log.completions.lock();
    assert!(completions.iter().all(|(_, success, _)| *success));
    let traces: Vec<&str> = completions.iter().map(|(t, _, _)| t.as_str()).collect();
    assert!(traces.contains(&first.as_str()));
    assert!(traces.contains(&second.as_str()));
}
