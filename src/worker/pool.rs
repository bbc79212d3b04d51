//! Elastic pool of ephemeral workers sharing one queue.
//!
//! A pool worker runs only while the shared queue has items and exits as
//! soon as it finds it empty. Each submission re-evaluates whether another
//! worker is needed, so the population follows the backlog in bursts and
//! never exceeds the configured ceiling.
//!
//! Ordering under the pool mutex: a submission reaps, decides whether to
//! spawn, then enqueues. A worker that finds the queue empty re-checks it
//! under the same mutex before removing itself, so no task is stranded
//! without a worker once the pool is started.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::context::ExecContext;
use crate::error::Result;
use crate::payload::{Args, Payload};
use crate::primitives::{Event, Primitives, TaskQueue, UnitHandle};
use crate::registry::Registry;
use crate::task::{Callable, Operand, Outcome, Resolver, Task, catch_fault};

#[derive(Debug)]
struct PoolItem {
    id: Uuid,
    task: Task,
}

#[derive(Debug)]
struct PendingTask {
    id: Uuid,
    repr: String,
}

#[derive(Debug)]
struct PoolWorker {
    id: Uuid,
    unit: UnitHandle,
}

#[derive(Debug, Default)]
struct PoolState {
    workers: Vec<PoolWorker>,
    pending: Vec<PendingTask>,
}

impl PoolState {
    /// Drop handles of workers that have exited.
    fn reap(&mut self) {
        self.workers.retain(|w| !w.unit.is_finished());
    }
}

/// Shared dependencies for pool workers.
#[derive(Clone)]
struct PoolDeps {
    name: String,
    crosses_boundary: bool,
    registry: Arc<Registry>,
    action: Option<Callable>,
    queue: TaskQueue<PoolItem>,
    state: Arc<Mutex<PoolState>>,
    stop: Event,
}

pub struct Pool {
    config: PoolConfig,
    primitives: Primitives,
    deps: PoolDeps,
    started: AtomicBool,
}

impl Pool {
    /// Create a pool. Tasks submitted before [`Pool::start`] wait in the queue.
    pub fn new(mut config: PoolConfig, ctx: &ExecContext) -> Self {
        if config.max_workers == 0 {
            tracing::warn!("Pool {} max_workers of 0 raised to 1", config.name);
            config.max_workers = 1;
        }
        let primitives = Primitives::new(config.flavor);
        let deps = PoolDeps {
            name: config.name.clone(),
            crosses_boundary: primitives.crosses_boundary(),
            registry: Arc::clone(ctx.registry()),
            action: None,
            queue: primitives.queue(&format!("{}-queue", config.name), None),
            state: primitives.mutex(PoolState::default()),
            stop: primitives.event(),
        };
        Self {
            config,
            primitives,
            deps,
            started: AtomicBool::new(false),
        }
    }

    /// Apply `action` to data items and to sequences of plain values.
    pub fn with_action(mut self, action: Callable) -> Self {
        self.deps.action = Some(action);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start processing, spawning workers for whatever is already queued.
    pub async fn start(&self) -> Result<()> {
        self.deps.stop.clear();
        self.started.store(true, Ordering::SeqCst);
        let mut state = self.deps.state.lock().await;
        state.reap();
        let wanted = self
            .deps
            .queue
            .len()
            .min(self.config.max_workers)
            .saturating_sub(state.workers.len());
        for _ in 0..wanted {
            self.spawn_worker(&mut state)?;
        }
        tracing::info!("Pool {} started with {} workers", self.config.name, state.workers.len());
        Ok(())
    }

    /// Queue a task, spawning a worker if the backlog calls for one.
    pub async fn submit(&self, task: Task) -> Result<()> {
        let id = Uuid::new_v4();
        let mut state = self.deps.state.lock().await;
        state.pending.push(PendingTask {
            id,
            repr: task.to_string(),
        });
        if self.is_started() {
            state.reap();
            if state.pending.len() > state.workers.len()
                && state.workers.len() < self.config.max_workers
                && let Err(e) = self.spawn_worker(&mut state)
            {
                state.pending.retain(|p| p.id != id);
                return Err(e);
            }
        }
        if let Err(e) = self.deps.queue.try_push(PoolItem { id, task }) {
            state.pending.retain(|p| p.id != id);
            return Err(e.into());
        }
        Ok(())
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<()> {
        let id = Uuid::new_v4();
        let unit_name = format!("{}-{}", self.config.name, &id.simple().to_string()[..8]);
        let deps = self.deps.clone();
        let unit = self
            .primitives
            .spawn(&unit_name, move || run_pool_worker(id, deps))?;
        tracing::debug!("Pool {} spawned worker {}", self.config.name, unit_name);
        state.workers.push(PoolWorker { id, unit });
        Ok(())
    }

    /// Text forms of tasks not finished yet.
    pub async fn pending(&self) -> Vec<String> {
        let mut state = self.deps.state.lock().await;
        state.reap();
        state.pending.iter().map(|p| p.repr.clone()).collect()
    }

    /// Number of live workers.
    pub async fn worker_count(&self) -> usize {
        let mut state = self.deps.state.lock().await;
        state.reap();
        state.workers.len()
    }

    /// Signal every worker, join each with a bounded wait, then reap.
    pub async fn stop(&self) {
        self.deps.stop.set();
        let workers = std::mem::take(&mut self.deps.state.lock().await.workers);
        let mut lingering = Vec::new();
        for mut worker in workers {
            if !worker.unit.join(Some(self.config.join_timeout)).await {
                tracing::warn!(
                    "Pool {} worker {} did not stop within {:?}",
                    self.config.name,
                    worker.unit.name(),
                    self.config.join_timeout
                );
                lingering.push(worker);
            }
        }
        let mut state = self.deps.state.lock().await;
        state.workers.extend(lingering);
        state.reap();
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("Pool {} stopped", self.config.name);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.name)
            .field("max_workers", &self.config.max_workers)
            .field("queued", &self.deps.queue.len())
            .field("started", &self.is_started())
            .finish()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.deps.stop.set();
    }
}

async fn run_pool_worker(id: Uuid, deps: PoolDeps) {
    let mut resolver = Resolver::new(Arc::clone(&deps.registry), deps.crosses_boundary);
    loop {
        if deps.stop.is_set() {
            break;
        }
        let Some(item) = deps.queue.try_pop() else {
            let mut state = deps.state.lock().await;
            if deps.queue.is_empty() {
                state.workers.retain(|w| w.id != id);
                break;
            }
            continue;
        };

        let outcome = catch_fault(execute_item(&deps, &mut resolver, &item.task)).await;
        if let Err(e) = &outcome {
            tracing::warn!("Pool {} task {} failed: {}", deps.name, item.task, e);
        }
        deps.state.lock().await.pending.retain(|p| p.id != item.id);
    }
}

async fn execute_item(deps: &PoolDeps, resolver: &mut Resolver, task: &Task) -> Outcome {
    let Some(action) = &deps.action else {
        return resolver.execute(task).await;
    };
    let args = match task {
        Task::Data(Payload::List(items)) => Args::Positional(items.clone()),
        Task::Data(value) => Args::Positional(vec![value.clone()]),
        Task::Sequence(items) if items.iter().all(|i| matches!(i, Operand::Value(_))) => {
            Args::Positional(
                items
                    .iter()
                    .filter_map(|i| match i {
                        Operand::Value(v) => Some(v.clone()),
                        Operand::Callable(_) => None,
                    })
                    .collect(),
            )
        }
        _ => return resolver.execute(task).await,
    };
    let value = action.invoke(args).await?;
    if deps.crosses_boundary {
        value.seal()
    } else {
        Ok(value)
    }
}
