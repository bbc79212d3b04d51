//! Background worker: one execution loop between an input and an output queue.

use std::sync::{Arc, Mutex, PoisonError};

use crate::config::WorkerConfig;
use crate::context::ExecContext;
use crate::error::{Error, QueueError, Result};
use crate::primitives::{Event, Primitives, TaskQueue, UnitHandle};
use crate::registry::Registry;
use crate::task::{Resolver, Task, TaskResult, catch_fault};
use crate::worker::state::WorkerState;

/// A task waiting in the input queue.
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub task: Task,
    pub key: Option<String>,
}

/// Everything the execution loop needs, cloned into the unit.
#[derive(Clone)]
struct LoopDeps {
    name: String,
    config: WorkerConfig,
    crosses_boundary: bool,
    registry: Arc<Registry>,
    input: TaskQueue<Submission>,
    output: TaskQueue<TaskResult>,
    errors: TaskQueue<String>,
    stop: Event,
}

impl LoopDeps {
    /// Log a fault; isolated units also report it to the submitter.
    fn report(&self, message: String) {
        if self.crosses_boundary {
            let _ = self.errors.try_push(message);
        }
    }
}

/// Worker that executes queued tasks in the background.
pub struct Worker {
    config: WorkerConfig,
    primitives: Primitives,
    registry: Arc<Registry>,
    input: TaskQueue<Submission>,
    output: TaskQueue<TaskResult>,
    errors: TaskQueue<String>,
    stop: Event,
    state: Mutex<WorkerState>,
    unit: Mutex<Option<UnitHandle>>,
}

impl Worker {
    /// Create a worker. Nothing runs until [`Worker::start`].
    pub fn new(config: WorkerConfig, ctx: &ExecContext) -> Self {
        let primitives = Primitives::new(config.flavor);
        let input = primitives.queue(&format!("{}-in", config.name), config.input_capacity);
        let output = primitives.queue(&format!("{}-out", config.name), config.output_capacity);
        let errors = primitives.queue(&format!("{}-errors", config.name), None);
        Self {
            primitives,
            registry: Arc::clone(ctx.registry()),
            input,
            output,
            errors,
            stop: primitives.event(),
            state: Mutex::new(WorkerState::Idle),
            unit: Mutex::new(None),
            config,
        }
    }

    /// Queue `task` so it runs as soon as the worker starts.
    pub fn with_initial_task(self, task: Task) -> Result<Self> {
        self.submit(task)?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state. A loop that exited on its own reads as stopped.
    pub fn state(&self) -> WorkerState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == WorkerState::Running && !self.is_alive() {
            WorkerState::Stopped
        } else {
            state
        }
    }

    fn transition(&self, target: WorkerState, action: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(target) {
            return Err(Error::InvalidState {
                name: self.config.name.clone(),
                action,
                state: state.to_string(),
            });
        }
        *state = target;
        Ok(())
    }

    /// Spawn the execution loop. Fails unless the worker is idle.
    pub fn start(&self) -> Result<()> {
        self.transition(WorkerState::Running, "start")?;
        let deps = LoopDeps {
            name: self.config.name.clone(),
            config: self.config.clone(),
            crosses_boundary: self.primitives.crosses_boundary(),
            registry: Arc::clone(&self.registry),
            input: self.input.clone(),
            output: self.output.clone(),
            errors: self.errors.clone(),
            stop: self.stop.clone(),
        };
        let unit = match self.primitives.spawn(&self.config.name, move || run_loop(deps)) {
            Ok(unit) => unit,
            Err(e) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WorkerState::Stopped;
                return Err(e.into());
            }
        };
        *self.unit.lock().unwrap_or_else(PoisonError::into_inner) = Some(unit);
        Ok(())
    }

    /// Signal the loop and wait for it to exit.
    ///
    /// A task already in flight runs to completion first. Later submissions
    /// are refused.
    pub async fn stop(&self) {
        self.input.close();
        self.stop.set();
        let unit = self.unit.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut unit) = unit {
            unit.join(None).await;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != WorkerState::Stopped {
            tracing::info!("Worker {} stopped", self.config.name);
            *state = WorkerState::Stopped;
        }
    }

    /// Enqueue a task without blocking.
    pub fn submit(&self, task: Task) -> Result<()> {
        self.enqueue(Submission { task, key: None })
    }

    pub(crate) fn enqueue(&self, submission: Submission) -> Result<()> {
        self.input.try_push(submission).map_err(Error::from)
    }

    /// Take the oldest finished result, if any.
    pub fn pull(&self) -> Option<TaskResult> {
        self.flush_error_reports();
        self.output.try_pop()
    }

    /// Take every finished result currently available.
    pub fn drain_all(&self) -> Vec<TaskResult> {
        self.flush_error_reports();
        self.output.drain()
    }

    fn flush_error_reports(&self) {
        for message in self.errors.drain() {
            tracing::warn!(worker = %self.config.name, "{}", message);
        }
    }

    /// True when nothing is queued for or waiting from this worker.
    pub fn is_idle(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }

    /// Number of tasks not yet picked up.
    pub fn pending(&self) -> usize {
        self.input.len()
    }

    pub fn is_alive(&self) -> bool {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|unit| !unit.is_finished())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config.name)
            .field("flavor", &self.config.flavor)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for Worker {
    /// Signal the loop without waiting for it; `stop` is the joining path.
    fn drop(&mut self) {
        self.input.close();
        self.stop.set();
    }
}

async fn run_loop(deps: LoopDeps) {
    tracing::info!("Worker {} started ({})", deps.name, deps.config.flavor);
    let mut resolver =
        Resolver::new(Arc::clone(&deps.registry), deps.crosses_boundary).with_trace(deps.config.trace);

    while !deps.stop.is_set() {
        let Some(Submission { task, key }) = deps.input.pop_timeout(deps.config.poll_interval).await
        else {
            continue;
        };
        if deps.stop.is_set() {
            tracing::debug!(worker = %deps.name, task = %task, "Dropping task dequeued after stop");
            break;
        }

        let outcome = catch_fault(resolver.execute(&task)).await;
        match &outcome {
            Ok(value) if deps.config.trace => {
                tracing::debug!(worker = %deps.name, task = %task, "=> {}", value);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(worker = %deps.name, task = %task, "Task failed: {}", e);
                deps.report(format!("Task {task} failed in worker {}: {e}", deps.name));
            }
        }

        match deps.output.try_push(TaskResult { task, key, outcome }) {
            Ok(()) => {}
            Err(QueueError::Overflow { capacity, .. }) => {
                tracing::error!(
                    worker = %deps.name,
                    "Output queue full (capacity {}), result dropped",
                    capacity
                );
                deps.report(format!(
                    "Output queue of worker {} overflowed (capacity {capacity})",
                    deps.name
                ));
            }
            Err(e) => {
                tracing::error!(worker = %deps.name, "Fatal: {}", e);
                deps.report(format!("Worker {} terminated: {e}", deps.name));
                break;
            }
        }
    }

    tracing::info!("Worker {} finished", deps.name);
}
