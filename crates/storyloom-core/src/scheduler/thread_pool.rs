//! DAG-aware thread-pool scheduler.
//!
//! A fixed pool of worker threads shares one condition variable and a
//! single mutex over all scheduler state. Workers pick the best Ready task
//! that fits the resource budgets, run its stage with the lock released,
//! and feed completion back into the graph: successes wake successors,
//! failures cascade cancellation to every transitive descendant.
//!
//! Pause is cooperative: a Running task is parked at its next progress
//! emission; a stage that never reports progress is auto-canceled when the
//! pause deadline elapses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::error::{code, ErrorCategory, TaskError};
use crate::logger::Logger;
use crate::scheduler::{Scheduler, SchedulerConfig, StateCallback};
use crate::stage::{Stage, StageContext};
use crate::task::{ResourceDemand, TaskDescriptor, TaskState};

const COMPONENT: &str = "scheduler";

/// One state-change notification, batched under the lock and delivered to
/// a snapshot of the callback list after the lock is released.
struct StateEvent {
    task_id: String,
    state: TaskState,
    progress: f32,
}

impl StateEvent {
    fn new(task_id: impl Into<String>, state: TaskState, progress: f32) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            progress,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ResourceUsage {
    cpu_slots: i32,
    ram_mb: i32,
    vram_mb: i32,
}

impl ResourceUsage {
    fn reserve(&mut self, demand: ResourceDemand) {
        self.cpu_slots += demand.cpu_slots;
        self.ram_mb += demand.ram_mb;
        self.vram_mb += demand.vram_mb;
    }

    fn release(&mut self, demand: ResourceDemand) {
        self.cpu_slots = (self.cpu_slots - demand.cpu_slots).max(0);
        self.ram_mb = (self.ram_mb - demand.ram_mb).max(0);
        self.vram_mb = (self.vram_mb - demand.vram_mb).max(0);
    }
}

/// Graph node: the descriptor plus everything the dispatcher needs.
struct Node {
    task: TaskDescriptor,
    stage: Arc<dyn Stage>,
    last_outputs: HashMap<String, Value>,
    unmet_deps: usize,
    ready_since: Instant,
    running: bool,
    pause_requested: bool,
    pause_deadline: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    stopping: bool,
    nodes: HashMap<String, Node>,
    /// predecessor id → successor ids; O(1) wake-up and cascade traversal.
    successors: HashMap<String, Vec<String>>,
    ready_set: HashSet<String>,
    running_set: HashSet<String>,
    in_use: ResourceUsage,
    callbacks: Vec<StateCallback>,
}

impl PoolState {
    fn fits_cpu_hard(&self, demand: ResourceDemand, config: &SchedulerConfig) -> bool {
        self.in_use.cpu_slots + demand.cpu_slots <= config.resource_budget.cpu_slots_hard
    }

    fn fits_soft(&self, demand: ResourceDemand, config: &SchedulerConfig) -> bool {
        let budget = &config.resource_budget;
        let ram_ok = budget.ram_soft_mb <= 0 || self.in_use.ram_mb + demand.ram_mb <= budget.ram_soft_mb;
        let vram_ok =
            budget.vram_soft_mb <= 0 || self.in_use.vram_mb + demand.vram_mb <= budget.vram_soft_mb;
        ram_ok && vram_ok
    }

    /// Defensive DFS over already-known successor edges. Strict submission
    /// order prevents cycles in the normal flow, but edges could in theory
    /// be built dynamically.
    fn creates_cycle(&self, task_id: &str, deps: &[String]) -> bool {
        let mut stack: Vec<&str> = deps.iter().map(String::as_str).collect();
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(current) = stack.pop() {
            if current == task_id {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(succs) = self.successors.get(current) {
                stack.extend(succs.iter().map(String::as_str));
            }
        }
        false
    }
}

struct Candidate {
    task_id: String,
    effective_priority: i64,
    ready_since: Instant,
    soft_fit: bool,
}

impl Candidate {
    fn better_than(&self, other: &Candidate) -> bool {
        if self.effective_priority != other.effective_priority {
            return self.effective_priority > other.effective_priority;
        }
        if self.ready_since != other.ready_since {
            return self.ready_since < other.ready_since;
        }
        self.task_id < other.task_id
    }
}

struct Inner {
    config: SchedulerConfig,
    logger: Arc<dyn Logger>,
    state: Mutex<PoolState>,
    work_available: Condvar,
}

/// The production scheduler. Spawns its worker pool at construction and
/// joins it on drop.
pub struct ThreadPoolScheduler {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolScheduler {
    pub fn new(config: SchedulerConfig, logger: Arc<dyn Logger>) -> Self {
        let config = config.normalized();
        let inner = Arc::new(Inner {
            config,
            logger,
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(inner.config.worker_count as usize);
        for _ in 0..inner.config.worker_count {
            let worker = Arc::clone(&inner);
            workers.push(thread::spawn(move || worker.worker_loop()));
        }

        Self { inner, workers }
    }

    /// The normalized configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Snapshot of a task's descriptor, for diagnostics and tests.
    pub fn task_snapshot(&self, task_id: &str) -> Option<TaskDescriptor> {
        let state = self.inner.state.lock();
        state.nodes.get(task_id).map(|node| node.task.clone())
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        self.inner.state.lock().stopping = true;
        self.inner.work_available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn submit(&self, task: TaskDescriptor, stage: Arc<dyn Stage>) -> Result<(), TaskError> {
        self.inner.submit(task, stage)
    }

    fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.cancel(task_id)
    }

    fn pause(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.pause(task_id)
    }

    fn resume(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.resume(task_id)
    }

    fn on_state_change(&self, cb: StateCallback) {
        self.inner.state.lock().callbacks.push(cb);
    }

    fn tick(&self) {
        self.inner.tick();
    }

    fn has_pending_tasks(&self) -> bool {
        let state = self.inner.state.lock();
        state.nodes.values().any(|node| !node.task.is_terminal())
    }
}

impl Inner {
    fn submit(&self, mut task: TaskDescriptor, stage: Arc<dyn Stage>) -> Result<(), TaskError> {
        let mut events: Vec<StateEvent> = Vec::new();
        {
            let mut state = self.state.lock();

            if task.task_id.is_empty() {
                return Err(TaskError::internal("task_id must not be empty"));
            }
            if state.nodes.contains_key(&task.task_id) {
                return Err(TaskError::internal(format!(
                    "Duplicate task_id: {}",
                    task.task_id
                )));
            }
            if task.state != TaskState::Queued {
                return Err(TaskError::internal(format!(
                    "Task must be submitted in Queued state, got {} (task_id={})",
                    task.state, task.task_id
                )));
            }

            task.resource_demand = task.resource_demand.normalized();
            if task.resource_demand.cpu_slots > self.config.resource_budget.cpu_slots_hard {
                return Err(TaskError::new(
                    ErrorCategory::Resource,
                    code::CPU_OVER_BUDGET,
                    false,
                    "Task requires too many CPU slots",
                    "resource_demand.cpu_slots exceeds hard CPU budget",
                )
                .with_detail("task_id", task.task_id.as_str())
                .with_detail("cpu_slots", task.resource_demand.cpu_slots.to_string())
                .with_detail(
                    "cpu_slots_hard",
                    self.config.resource_budget.cpu_slots_hard.to_string(),
                ));
            }

            // Validate every dependency before mutating the graph, so a
            // rejected submit leaves no partial successor edges behind.
            for dep_id in &task.deps {
                if dep_id == &task.task_id {
                    return Err(TaskError::internal(format!(
                        "Task cannot depend on itself: {}",
                        task.task_id
                    )));
                }
                if !state.nodes.contains_key(dep_id) {
                    return Err(TaskError::internal(format!("Dependency not found: {dep_id}")));
                }
            }
            if state.creates_cycle(&task.task_id, &task.deps) {
                return Err(TaskError::internal(format!(
                    "Dependency cycle detected for task: {}",
                    task.task_id
                )));
            }

            let mut unmet_deps = 0usize;
            let mut blocked_dep: Option<String> = None;
            for dep_id in &task.deps {
                let Some(dep) = state.nodes.get(dep_id) else {
                    continue;
                };
                match dep.task.state {
                    TaskState::Succeeded => {}
                    TaskState::Failed | TaskState::Canceled => {
                        blocked_dep = Some(dep_id.clone());
                        break;
                    }
                    _ => unmet_deps += 1,
                }
            }

            let task_id = task.task_id.clone();
            for dep_id in &task.deps {
                state
                    .successors
                    .entry(dep_id.clone())
                    .or_default()
                    .push(task_id.clone());
            }

            self.logger.info(
                &task.trace_id,
                COMPONENT,
                "task_submitted",
                &format!(
                    "task_id={} type={} priority={} deps={}",
                    task_id,
                    task.task_type,
                    task.priority,
                    task.deps.len()
                ),
            );

            let mut node = Node {
                task,
                stage,
                last_outputs: HashMap::new(),
                unmet_deps,
                ready_since: Instant::now(),
                running: false,
                pause_requested: false,
                pause_deadline: None,
            };

            if let Some(dep_id) = blocked_dep {
                node.task.error = Some(
                    TaskError::new(
                        ErrorCategory::Canceled,
                        code::DEPENDENCY_BLOCKED,
                        false,
                        "Task canceled because a dependency already failed",
                        "Dependency already terminal before submit",
                    )
                    .with_detail("dependency_task_id", dep_id),
                );
                if node.task.transition_to(TaskState::Canceled).is_ok() {
                    events.push(StateEvent::new(&task_id, TaskState::Canceled, node.task.progress));
                }
            } else if unmet_deps == 0 {
                node.task.transition_to(TaskState::Ready)?;
                node.ready_since = Instant::now();
                state.ready_set.insert(task_id.clone());
                events.push(StateEvent::new(&task_id, TaskState::Ready, node.task.progress));
            }

            state.nodes.insert(task_id, node);
        }

        self.dispatch_events(&events);
        self.work_available.notify_all();
        Ok(())
    }

    fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events: Vec<StateEvent> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(task_id) else {
                return Err(TaskError::internal(format!("Task not found: {task_id}")));
            };

            node.task.cancel_token.request_cancel();

            if node.task.state == TaskState::Canceled {
                node.pause_requested = false;
                node.pause_deadline = None;
                drop(state);
                self.work_available.notify_all();
                return Ok(());
            }

            let was_ready = node.task.state == TaskState::Ready;
            node.pause_requested = false;
            node.pause_deadline = None;

            let mut should_propagate = false;
            if !node.task.is_terminal() {
                node.task.transition_to(TaskState::Canceled)?;
                if node.task.error.is_none() {
                    node.task.error = Some(TaskError::canceled());
                }
                events.push(StateEvent::new(task_id, TaskState::Canceled, node.task.progress));
                should_propagate = true;
            }

            if was_ready {
                state.ready_set.remove(task_id);
            }
            if should_propagate {
                Self::propagate_dependency_canceled(&mut state, task_id, &mut events);
            }
        }

        self.dispatch_events(&events);
        self.work_available.notify_all();
        Ok(())
    }

    fn pause(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events: Vec<StateEvent> = Vec::new();
        let mut timed_out = false;
        {
            let mut state = self.state.lock();
            let current = match state.nodes.get(task_id) {
                Some(node) => node.task.state,
                None => {
                    return Err(TaskError::internal(format!("Task not found: {task_id}")));
                }
            };

            match current {
                TaskState::Paused => {}
                TaskState::Queued | TaskState::Ready => {
                    if current == TaskState::Ready {
                        state.ready_set.remove(task_id);
                    }
                    let Some(node) = state.nodes.get_mut(task_id) else {
                        return Err(TaskError::internal(format!("Task not found: {task_id}")));
                    };
                    node.task.transition_to(TaskState::Paused)?;
                    events.push(StateEvent::new(task_id, TaskState::Paused, node.task.progress));
                }
                TaskState::Running => {
                    let timeout_ms = self.config.pause_policy.checkpoint_timeout_ms.max(1) as u64;
                    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                    if let Some(node) = state.nodes.get_mut(task_id) {
                        node.pause_requested = true;
                        node.pause_deadline = Some(deadline);
                    }

                    // Wait for the stage to reach its next checkpoint, or
                    // for the deadline to pass.
                    loop {
                        let reached = match state.nodes.get(task_id) {
                            None => true,
                            Some(node) => {
                                node.task.state == TaskState::Paused || node.task.is_terminal()
                            }
                        };
                        if reached {
                            break;
                        }
                        if self
                            .work_available
                            .wait_until(&mut state, deadline)
                            .timed_out()
                        {
                            let reached = match state.nodes.get(task_id) {
                                None => true,
                                Some(node) => {
                                    node.task.state == TaskState::Paused || node.task.is_terminal()
                                }
                            };
                            timed_out = !reached;
                            break;
                        }
                    }
                }
                TaskState::Canceled | TaskState::Failed | TaskState::Succeeded => {
                    return Err(TaskError::internal(
                        "pause() only supports Queued/Ready/Running/Paused task states",
                    ));
                }
            }
        }

        if timed_out {
            self.logger.warn(
                "",
                COMPONENT,
                "pause_timeout",
                &format!("task_id={task_id} missed its pause checkpoint; auto-canceling"),
            );
            let _ = self.cancel(task_id);
            return Err(TaskError::new(
                ErrorCategory::Timeout,
                code::PAUSE_TIMEOUT,
                false,
                "Pause timed out and task was canceled",
                "Pause checkpoint timeout, auto-canceled task",
            )
            .with_detail("task_id", task_id));
        }

        self.dispatch_events(&events);
        self.work_available.notify_all();
        Ok(())
    }

    fn resume(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events: Vec<StateEvent> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(task_id) else {
                return Err(TaskError::internal(format!("Task not found: {task_id}")));
            };
            if node.task.state != TaskState::Paused {
                return Err(TaskError::internal(format!("Task is not paused: {task_id}")));
            }

            let mut target = node.task.paused_from.unwrap_or(TaskState::Running);
            // Dependencies may have all succeeded while the task was paused
            // from Queued; going back to Queued would strand it, since the
            // wake-on-success moment has already passed.
            if target == TaskState::Queued && node.unmet_deps == 0 {
                target = TaskState::Ready;
            }
            node.task.transition_to(target)?;
            node.pause_requested = false;
            node.pause_deadline = None;
            let progress = node.task.progress;
            if target == TaskState::Ready {
                node.ready_since = Instant::now();
                state.ready_set.insert(task_id.to_string());
            }
            events.push(StateEvent::new(task_id, target, progress));
        }

        self.dispatch_events(&events);
        self.work_available.notify_all();
        Ok(())
    }

    /// Auto-cancel Running tasks whose pause deadline elapsed without the
    /// stage reaching a checkpoint. Cheap to call periodically.
    fn tick(&self) {
        let expired: Vec<String> = {
            let state = self.state.lock();
            let now = Instant::now();
            state
                .nodes
                .iter()
                .filter(|(_, node)| {
                    node.task.state == TaskState::Running
                        && node.pause_requested
                        && node.pause_deadline.is_some_and(|deadline| now >= deadline)
                })
                .map(|(task_id, _)| task_id.clone())
                .collect()
        };

        for task_id in expired {
            let _ = self.cancel(&task_id);
        }
        self.work_available.notify_all();
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let mut run_events: Vec<StateEvent> = Vec::new();
            let mut job: Option<(String, Arc<dyn Stage>, StageContext)> = None;

            {
                let mut state = self.state.lock();
                loop {
                    if state.stopping {
                        return;
                    }
                    if Self::pick_candidate(&state, &self.config, true).is_some() {
                        break;
                    }
                    self.work_available.wait(&mut state);
                }

                let Some(task_id) = Self::pick_candidate(&state, &self.config, true) else {
                    continue;
                };

                state.ready_set.remove(&task_id);
                let Some(node) = state.nodes.get_mut(&task_id) else {
                    continue;
                };

                match node.task.transition_to(TaskState::Running) {
                    Err(err) => {
                        node.task.error = Some(err);
                        if node.task.transition_to(TaskState::Failed).is_ok() {
                            run_events.push(StateEvent::new(
                                &task_id,
                                TaskState::Failed,
                                node.task.progress,
                            ));
                        }
                    }
                    Ok(()) => {
                        node.running = true;
                        node.pause_requested = false;
                        node.pause_deadline = None;

                        let demand = node.task.resource_demand;
                        let trace_id = node.task.trace_id.clone();
                        let token = Arc::clone(&node.task.cancel_token);
                        let stage = Arc::clone(&node.stage);
                        let deps = node.task.deps.clone();
                        let seed = node.task.seed_inputs.clone();
                        let progress = node.task.progress;

                        state.in_use.reserve(demand);
                        state.running_set.insert(task_id.clone());

                        let mut ctx =
                            StageContext::new(trace_id, token).with_progress_sink(Box::new({
                                let inner = Arc::clone(&self);
                                let id = task_id.clone();
                                move |p| inner.handle_progress(&id, p)
                            }));
                        for (key, value) in seed {
                            ctx.insert_input(key, value);
                        }
                        for dep_id in &deps {
                            if let Some(dep) = state.nodes.get(dep_id) {
                                for (key, value) in &dep.last_outputs {
                                    ctx.insert_input(key.clone(), value.clone());
                                }
                            }
                        }

                        run_events.push(StateEvent::new(&task_id, TaskState::Running, progress));
                        job = Some((task_id.clone(), stage, ctx));
                    }
                }
            }

            self.dispatch_events(&run_events);
            let Some((task_id, stage, mut ctx)) = job else {
                self.work_available.notify_all();
                continue;
            };

            let result = stage.execute(&mut ctx);
            self.finalize_execution(&task_id, ctx.into_outputs(), result);
        }
    }

    /// Progress callback wired into every dispatched stage context. Updates
    /// the task, re-emits a Running event and, when a pause was requested,
    /// parks the worker here until the task is resumed, canceled or the
    /// scheduler shuts down.
    fn handle_progress(&self, task_id: &str, progress: f32) {
        let mut immediate: Vec<StateEvent> = Vec::new();
        let mut should_wait = false;
        {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(task_id) else {
                return;
            };
            node.task.set_progress(progress);
            if node.task.state == TaskState::Running {
                immediate.push(StateEvent::new(task_id, TaskState::Running, node.task.progress));
            }

            if node.pause_requested
                && node.task.state == TaskState::Running
                && node.task.transition_to(TaskState::Paused).is_ok()
            {
                node.pause_requested = false;
                node.pause_deadline = None;
                immediate.push(StateEvent::new(task_id, TaskState::Paused, node.task.progress));
                should_wait = true;
            }
        }

        if should_wait {
            // Wake the pause() caller blocked on the same condvar.
            self.work_available.notify_all();
        }
        self.dispatch_events(&immediate);
        if !should_wait {
            return;
        }

        let mut post_wait: Vec<StateEvent> = Vec::new();
        {
            let mut state = self.state.lock();
            loop {
                if state.stopping {
                    break;
                }
                match state.nodes.get(task_id) {
                    None => break,
                    Some(node) if node.task.state != TaskState::Paused => break,
                    Some(_) => {}
                }
                self.work_available.wait(&mut state);
            }

            if let Some(node) = state.nodes.get(task_id) {
                if node.task.state == TaskState::Running {
                    post_wait.push(StateEvent::new(task_id, TaskState::Running, node.task.progress));
                }
            }
        }
        self.dispatch_events(&post_wait);
    }

    fn finalize_execution(
        &self,
        task_id: &str,
        outputs: HashMap<String, Value>,
        result: Result<(), TaskError>,
    ) {
        let mut events: Vec<StateEvent> = Vec::new();
        {
            let mut state = self.state.lock();

            let (was_running, demand, trace_id) = match state.nodes.get_mut(task_id) {
                None => return,
                Some(node) => {
                    let was_running = node.running;
                    node.running = false;
                    (was_running, node.task.resource_demand, node.task.trace_id.clone())
                }
            };
            if was_running {
                state.running_set.remove(task_id);
                state.in_use.release(demand);
            }

            let current = match state.nodes.get(task_id) {
                None => return,
                Some(node) => node.task.state,
            };

            if current == TaskState::Canceled {
                // Canceled concurrently while the stage was running; keep it,
                // even if the stage returned success.
                self.logger.info(
                    &trace_id,
                    COMPONENT,
                    "task_canceled",
                    &format!("task_id={task_id} canceled while running"),
                );
                Self::propagate_dependency_canceled(&mut state, task_id, &mut events);
            } else {
                match result {
                    Ok(()) => {
                        let succeeded = match state.nodes.get_mut(task_id) {
                            None => return,
                            Some(node) => match node.task.transition_to(TaskState::Succeeded) {
                                Ok(()) => {
                                    node.task.set_progress(1.0);
                                    node.last_outputs = outputs;
                                    true
                                }
                                Err(err) => {
                                    node.task.error = Some(err);
                                    if node.task.transition_to(TaskState::Failed).is_ok() {
                                        events.push(StateEvent::new(
                                            task_id,
                                            TaskState::Failed,
                                            node.task.progress,
                                        ));
                                    }
                                    false
                                }
                            },
                        };

                        if succeeded {
                            self.logger.info(
                                &trace_id,
                                COMPONENT,
                                "task_succeeded",
                                &format!("task_id={task_id}"),
                            );
                            events.push(StateEvent::new(task_id, TaskState::Succeeded, 1.0));
                            Self::wake_successors(&mut state, task_id, &mut events);
                        } else {
                            Self::propagate_dependency_canceled(&mut state, task_id, &mut events);
                        }
                    }
                    Err(err) => {
                        let final_state = match state.nodes.get_mut(task_id) {
                            None => return,
                            Some(node) => {
                                let canceled =
                                    err.is_canceled() || node.task.cancel_token.is_canceled();
                                node.task.error = Some(err);
                                let target = if canceled {
                                    TaskState::Canceled
                                } else {
                                    TaskState::Failed
                                };
                                if node.task.transition_to(target).is_ok() {
                                    events.push(StateEvent::new(
                                        task_id,
                                        target,
                                        node.task.progress,
                                    ));
                                }
                                target
                            }
                        };

                        let event = if final_state == TaskState::Canceled {
                            "task_canceled"
                        } else {
                            "task_failed"
                        };
                        self.logger
                            .error(&trace_id, COMPONENT, event, &format!("task_id={task_id}"));
                        Self::propagate_dependency_canceled(&mut state, task_id, &mut events);
                    }
                }
            }
        }

        self.dispatch_events(&events);
        self.work_available.notify_all();
    }

    /// On success, decrement each direct successor's unmet-dependency count
    /// and promote to Ready when it reaches zero.
    ///
    /// A successor paused while Queued still gets its count decremented —
    /// dropping it there would lose the wake-up for good; the promotion is
    /// deferred to resume().
    fn wake_successors(state: &mut PoolState, task_id: &str, events: &mut Vec<StateEvent>) {
        let succ_ids = state.successors.get(task_id).cloned().unwrap_or_default();
        for succ_id in succ_ids {
            let mut became_ready: Option<f32> = None;
            if let Some(succ) = state.nodes.get_mut(&succ_id) {
                let waiting = matches!(succ.task.state, TaskState::Queued | TaskState::Paused);
                if waiting && succ.unmet_deps > 0 {
                    succ.unmet_deps -= 1;
                    if succ.unmet_deps == 0
                        && succ.task.state == TaskState::Queued
                        && succ.task.transition_to(TaskState::Ready).is_ok()
                    {
                        succ.ready_since = Instant::now();
                        became_ready = Some(succ.task.progress);
                    }
                }
            }
            if let Some(progress) = became_ready {
                state.ready_set.insert(succ_id.clone());
                events.push(StateEvent::new(&succ_id, TaskState::Ready, progress));
            }
        }
    }

    /// DFS over successor edges, canceling every non-terminal transitive
    /// descendant. Terminal descendants are skipped but still traversed so
    /// deeper descendants are reached.
    fn propagate_dependency_canceled(
        state: &mut PoolState,
        root_id: &str,
        events: &mut Vec<StateEvent>,
    ) {
        let mut stack: Vec<String> = vec![root_id.to_string()];
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(current) = stack.pop() {
            let succ_ids = state.successors.get(&current).cloned().unwrap_or_default();
            for succ_id in succ_ids {
                if !visited.insert(succ_id.clone()) {
                    continue;
                }

                let mut canceled_progress: Option<f32> = None;
                let mut was_ready = false;
                match state.nodes.get_mut(&succ_id) {
                    None => continue,
                    Some(node) if node.task.is_terminal() => {
                        stack.push(succ_id);
                        continue;
                    }
                    Some(node) => {
                        node.task.cancel_token.request_cancel();
                        was_ready = node.task.state == TaskState::Ready;
                        node.task.error = Some(
                            TaskError::new(
                                ErrorCategory::Canceled,
                                code::DEPENDENCY_CASCADE,
                                false,
                                "Task canceled due to dependency failure",
                                "Ancestor task failed or canceled",
                            )
                            .with_detail("dependency_task_id", current.clone()),
                        );
                        if node.task.transition_to(TaskState::Canceled).is_ok() {
                            canceled_progress = Some(node.task.progress);
                        }
                    }
                }

                if was_ready {
                    state.ready_set.remove(&succ_id);
                }
                if let Some(progress) = canceled_progress {
                    events.push(StateEvent::new(&succ_id, TaskState::Canceled, progress));
                }
                stack.push(succ_id);
            }
        }
    }

    /// Choose the best dispatchable task under the scheduler lock.
    ///
    /// Ranking: effective priority (base + aging boost) descending, then
    /// older `ready_since`, then lexicographic task id. Soft-over tasks are
    /// only eligible when nothing is running (the escape hatch).
    fn pick_candidate(
        state: &PoolState,
        config: &SchedulerConfig,
        allow_escape: bool,
    ) -> Option<String> {
        let now = Instant::now();
        let mut best_soft_fit: Option<Candidate> = None;
        let mut best_soft_over: Option<Candidate> = None;

        for task_id in &state.ready_set {
            let Some(node) = state.nodes.get(task_id) else {
                continue;
            };
            if node.task.state != TaskState::Ready {
                continue;
            }
            let demand = node.task.resource_demand;
            if !state.fits_cpu_hard(demand, config) {
                continue;
            }

            let wait_ms = now.saturating_duration_since(node.ready_since).as_millis() as i64;
            let intervals = wait_ms / i64::from(config.aging_policy.interval_ms.max(1));
            let effective_priority = i64::from(node.task.priority)
                + intervals * i64::from(config.aging_policy.boost_per_interval);

            let candidate = Candidate {
                task_id: task_id.clone(),
                effective_priority,
                ready_since: node.ready_since,
                soft_fit: state.fits_soft(demand, config),
            };

            let slot = if candidate.soft_fit {
                &mut best_soft_fit
            } else {
                &mut best_soft_over
            };
            if slot.as_ref().is_none_or(|best| candidate.better_than(best)) {
                *slot = Some(candidate);
            }
        }

        if let Some(best) = best_soft_fit {
            return Some(best.task_id);
        }
        if allow_escape && state.running_set.is_empty() {
            return best_soft_over.map(|best| best.task_id);
        }
        None
    }

    /// Deliver events to a snapshot of the callback list with no scheduler
    /// locks held, avoiding reentrancy deadlocks.
    fn dispatch_events(&self, events: &[StateEvent]) {
        if events.is_empty() {
            return;
        }
        let callbacks = self.state.lock().callbacks.clone();
        for event in events {
            for cb in &callbacks {
                cb(&event.task_id, event.state, event.progress);
            }
        }
    }
}
