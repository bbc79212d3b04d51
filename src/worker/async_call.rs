//! Fire-and-forget invocation of a single callable.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::SpawnError;
use crate::payload::Args;
use crate::primitives::{Event, Flavor, Primitives, UnitHandle};
use crate::task::{Callable, Outcome};

/// Handle to a callable running on its own unit.
///
/// The outcome, fault included, is stored for the caller to collect; nothing
/// is raised on the caller's side.
pub struct AsyncCall {
    name: String,
    done: Event,
    outcome: Arc<Mutex<Option<Outcome>>>,
    unit: UnitHandle,
}

impl AsyncCall {
    /// Spawn one unit that invokes `callable` with no arguments.
    pub fn run(flavor: Flavor, callable: Callable) -> Result<Self, SpawnError> {
        let primitives = Primitives::new(flavor);
        let name = format!("async-{}", callable.name());
        let done = primitives.event();
        let outcome = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&outcome);
        let finished = done.clone();
        let crosses_boundary = primitives.crosses_boundary();
        let unit = primitives.spawn(&name, move || async move {
            let mut result = callable.invoke(Args::none()).await;
            if crosses_boundary {
                result = result.and_then(|value| value.seal());
            }
            if let Err(e) = &result {
                tracing::debug!(call = %callable.name(), "Async call failed: {}", e);
            }
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            finished.set();
        })?;

        Ok(Self {
            name,
            done,
            outcome,
            unit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_set()
    }

    /// Wait for completion, up to `timeout` if given. Returns true once done.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        self.done.wait(timeout).await
    }

    /// Take the stored outcome, if the call has finished and it was not
    /// taken already.
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the unit to exit and hand back its outcome.
    pub async fn join(mut self) -> Option<Outcome> {
        self.unit.join(None).await;
        self.take_outcome()
    }
}

impl std::fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCall")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
