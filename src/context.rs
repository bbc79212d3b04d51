//! Execution context shared by the components a caller builds.
//!
//! Holds the frozen registry, the external-command runner and the one
//! process-wide keyed worker, created on first use.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::registry::builtin::{CommandRunner, ShellCommand};
use crate::worker::KeyedWorker;

pub struct ExecContext {
    registry: Arc<Registry>,
    runner: Arc<dyn CommandRunner>,
    keyed: OnceCell<Arc<KeyedWorker>>,
}

impl ExecContext {
    /// Freeze `registry`, adding the `shell` namespace backed by `sh -c`.
    pub fn new(registry: Registry) -> Self {
        Self::with_runner(registry, Arc::new(ShellCommand::new()))
    }

    /// Freeze `registry`, adding the `shell` namespace backed by `runner`
    /// unless one is already registered.
    pub fn with_runner(mut registry: Registry, runner: Arc<dyn CommandRunner>) -> Self {
        if !registry.has_namespace("shell") {
            registry.register_namespace(ShellCommand::namespace(Arc::clone(&runner)));
        }
        Self {
            registry: Arc::new(registry),
            runner,
            keyed: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// The shared keyed worker, built and started on the first call.
    ///
    /// Its configuration comes from the environment (see
    /// [`WorkerConfig::from_env`]).
    pub async fn keyed_worker(&self) -> Result<Arc<KeyedWorker>> {
        let worker = self
            .keyed
            .get_or_try_init(|| async {
                let config = WorkerConfig::from_env()?.with_name("keyed-worker");
                let worker = KeyedWorker::new(config, self);
                worker.start()?;
                tracing::info!("Shared keyed worker started");
                Ok::<_, crate::error::Error>(Arc::new(worker))
            })
            .await?;
        Ok(Arc::clone(worker))
    }

    /// Stop the shared keyed worker, if one was started.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.keyed.get() {
            worker.stop().await;
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("registry", &self.registry)
            .field("keyed_worker", &self.keyed.initialized())
            .finish()
    }
}
