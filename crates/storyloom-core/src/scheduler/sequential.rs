//! Single-threaded, tick-driven scheduler.
//!
//! Each `tick()` promotes Queued tasks whose dependencies have all
//! Succeeded, then executes the highest-priority Ready task synchronously.
//! No worker pool, no resource budgets, no aging, no in-flight pause — a
//! deterministic harness that proves the [`Scheduler`] seam and keeps
//! engine-level tests free of timing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::TaskError;
use crate::scheduler::{Scheduler, StateCallback};
use crate::stage::{Stage, StageContext};
use crate::task::{TaskDescriptor, TaskState};

struct Entry {
    task: TaskDescriptor,
    stage: Arc<dyn Stage>,
    last_outputs: HashMap<String, Value>,
}

#[derive(Default)]
struct SeqState {
    entries: Vec<Entry>,
    callbacks: Vec<StateCallback>,
}

impl SeqState {
    fn find(&self, task_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.task.task_id == task_id)
    }
}

struct SeqInner {
    state: Mutex<SeqState>,
}

impl SeqInner {
    fn notify(&self, events: &[(String, TaskState, f32)]) {
        if events.is_empty() {
            return;
        }
        let callbacks = self.state.lock().callbacks.clone();
        for (task_id, state, progress) in events {
            for cb in &callbacks {
                cb(task_id, *state, *progress);
            }
        }
    }
}

/// Sequential, tick-driven [`Scheduler`] implementation.
#[derive(Default)]
pub struct SequentialScheduler {
    inner: Arc<SeqInner>,
}

impl Default for SeqInner {
    fn default() -> Self {
        Self {
            state: Mutex::new(SeqState::default()),
        }
    }
}

impl SequentialScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for SequentialScheduler {
    fn submit(&self, mut task: TaskDescriptor, stage: Arc<dyn Stage>) -> Result<(), TaskError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();

            if task.task_id.is_empty() {
                return Err(TaskError::internal("task_id must not be empty"));
            }
            if state.find(&task.task_id).is_some() {
                return Err(TaskError::internal(format!(
                    "Duplicate task_id: {}",
                    task.task_id
                )));
            }
            for dep_id in &task.deps {
                if dep_id == &task.task_id {
                    return Err(TaskError::internal(format!(
                        "Task cannot depend on itself: {}",
                        task.task_id
                    )));
                }
                if state.find(dep_id).is_none() {
                    return Err(TaskError::internal(format!("Dependency not found: {dep_id}")));
                }
            }

            if task.deps.is_empty() {
                task.transition_to(TaskState::Ready)?;
                events.push((task.task_id.clone(), TaskState::Ready, task.progress));
            }

            state.entries.push(Entry {
                task,
                stage,
                last_outputs: HashMap::new(),
            });
        }
        self.inner.notify(&events);
        Ok(())
    }

    fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.find(task_id) else {
                return Err(TaskError::internal(format!("Task not found: {task_id}")));
            };
            let entry = &mut state.entries[index];
            entry.task.cancel_token.request_cancel();

            if entry.task.state == TaskState::Canceled {
                return Ok(());
            }
            entry.task.transition_to(TaskState::Canceled)?;
            if entry.task.error.is_none() {
                entry.task.error = Some(TaskError::canceled());
            }
            events.push((task_id.to_string(), TaskState::Canceled, entry.task.progress));
        }
        self.inner.notify(&events);
        Ok(())
    }

    fn pause(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.find(task_id) else {
                return Err(TaskError::internal(format!("Task not found: {task_id}")));
            };
            let entry = &mut state.entries[index];
            entry.task.transition_to(TaskState::Paused)?;
            events.push((task_id.to_string(), TaskState::Paused, entry.task.progress));
        }
        self.inner.notify(&events);
        Ok(())
    }

    fn resume(&self, task_id: &str) -> Result<(), TaskError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.find(task_id) else {
                return Err(TaskError::internal(format!("Task not found: {task_id}")));
            };
            let entry = &mut state.entries[index];
            if entry.task.state != TaskState::Paused {
                return Err(TaskError::internal(format!("Task is not paused: {task_id}")));
            }
            let target = entry.task.paused_from.unwrap_or(TaskState::Running);
            entry.task.transition_to(target)?;
            events.push((task_id.to_string(), target, entry.task.progress));
        }
        self.inner.notify(&events);
        Ok(())
    }

    fn on_state_change(&self, cb: StateCallback) {
        self.inner.state.lock().callbacks.push(cb);
    }

    fn tick(&self) {
        let mut events = Vec::new();
        let job = {
            let mut state = self.inner.state.lock();

            // Promote Queued tasks whose dependencies are all Succeeded.
            let promotable: Vec<usize> = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| {
                    entry.task.state == TaskState::Queued
                        && !entry.task.deps.is_empty()
                        && entry.task.deps.iter().all(|dep_id| {
                            state
                                .find(dep_id)
                                .map(|i| state.entries[i].task.state == TaskState::Succeeded)
                                .unwrap_or(false)
                        })
                })
                .map(|(index, _)| index)
                .collect();
            for index in promotable {
                let entry = &mut state.entries[index];
                if entry.task.transition_to(TaskState::Ready).is_ok() {
                    events.push((entry.task.task_id.clone(), TaskState::Ready, 0.0));
                }
            }

            // Pick the highest-priority Ready task.
            let best = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.task.state == TaskState::Ready)
                .max_by_key(|(_, entry)| entry.task.priority)
                .map(|(index, _)| index);

            match best {
                None => None,
                Some(index) => {
                    let (task_id, trace_id, token, stage, seed, deps) = {
                        let entry = &mut state.entries[index];
                        if entry.task.transition_to(TaskState::Running).is_err() {
                            return;
                        }
                        events.push((entry.task.task_id.clone(), TaskState::Running, 0.0));
                        (
                            entry.task.task_id.clone(),
                            entry.task.trace_id.clone(),
                            Arc::clone(&entry.task.cancel_token),
                            Arc::clone(&entry.stage),
                            entry.task.seed_inputs.clone(),
                            entry.task.deps.clone(),
                        )
                    };

                    let mut ctx = StageContext::new(trace_id, token).with_progress_sink(Box::new({
                        let inner = Arc::clone(&self.inner);
                        let id = task_id.clone();
                        move |p| {
                            let mut events = Vec::new();
                            {
                                let mut state = inner.state.lock();
                                if let Some(index) = state.find(&id) {
                                    let entry = &mut state.entries[index];
                                    entry.task.set_progress(p);
                                    events.push((
                                        id.clone(),
                                        TaskState::Running,
                                        entry.task.progress,
                                    ));
                                }
                            }
                            inner.notify(&events);
                        }
                    }));
                    for (key, value) in seed {
                        ctx.insert_input(key, value);
                    }
                    for dep_id in &deps {
                        if let Some(dep_index) = state.find(dep_id) {
                            for (key, value) in &state.entries[dep_index].last_outputs {
                                ctx.insert_input(key.clone(), value.clone());
                            }
                        }
                    }

                    Some((task_id, stage, ctx))
                }
            }
        };

        self.inner.notify(&events);
        let Some((task_id, stage, mut ctx)) = job else {
            return;
        };

        // Lock released during execution so cancel can land from another
        // thread.
        let result = stage.execute(&mut ctx);

        let mut done_events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(index) = state.find(&task_id) else {
                return;
            };
            let entry = &mut state.entries[index];

            if entry.task.state == TaskState::Canceled {
                // Canceled mid-run; keep it.
            } else {
                match result {
                    Ok(()) => {
                        if entry.task.transition_to(TaskState::Succeeded).is_ok() {
                            entry.task.set_progress(1.0);
                            entry.last_outputs = ctx.into_outputs();
                            done_events.push((task_id.clone(), TaskState::Succeeded, 1.0));
                        }
                    }
                    Err(err) => {
                        let canceled =
                            err.is_canceled() || entry.task.cancel_token.is_canceled();
                        entry.task.error = Some(err);
                        let target = if canceled {
                            TaskState::Canceled
                        } else {
                            TaskState::Failed
                        };
                        if entry.task.transition_to(target).is_ok() {
                            done_events.push((task_id.clone(), target, entry.task.progress));
                        }
                    }
                }
            }
        }
        self.inner.notify(&done_events);
    }

    fn has_pending_tasks(&self) -> bool {
        let state = self.inner.state.lock();
        state.entries.iter().any(|entry| !entry.task.is_terminal())
    }
}
