//! Concurrency primitive set.
//!
//! Every higher component is written against [`Primitives`] only. The flavor
//! picked at construction decides what a unit of execution is:
//! - `SharedMemory`: a tokio task on the caller's runtime.
//! - `IsolatedMemory`: a dedicated OS thread driving its own current-thread
//!   runtime. Only queues and events are shared with the submitter, and
//!   results are sealed through their wire form before crossing back.

use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{QueueError, SpawnError};

/// Which kind of execution unit a component runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    /// Units share the submitter's address space.
    #[default]
    SharedMemory,
    /// Units keep no state in common with the submitter or each other.
    IsolatedMemory,
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedMemory => write!(f, "shared"),
            Self::IsolatedMemory => write!(f, "isolated"),
        }
    }
}

impl FromStr for Flavor {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" | "thread" | "shared_memory" => Ok(Self::SharedMemory),
            "isolated" | "process" | "isolated_memory" => Ok(Self::IsolatedMemory),
            other => Err(format!("unknown flavor: {other}")),
        }
    }
}

/// Factory bundle for units, queues, events and mutexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitives {
    flavor: Flavor,
}

impl Primitives {
    pub fn new(flavor: Flavor) -> Self {
        Self { flavor }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Whether results must be sealed before being handed back.
    pub fn crosses_boundary(&self) -> bool {
        self.flavor == Flavor::IsolatedMemory
    }

    /// Spawn a unit of execution running `entry`.
    pub fn spawn<F, Fut>(&self, name: &str, entry: F) -> Result<UnitHandle, SpawnError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.flavor {
            Flavor::SharedMemory => {
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    SpawnError::NoRuntime {
                        name: name.to_string(),
                    }
                })?;
                Ok(UnitHandle {
                    name: name.to_string(),
                    inner: UnitInner::Task(Some(handle.spawn(entry()))),
                })
            }
            Flavor::IsolatedMemory => {
                let done = Event::new();
                let guard = DoneGuard(done.clone());
                let thread_name = name.to_string();
                let handle = std::thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || {
                        let _guard = guard;
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(rt) => rt.block_on(entry()),
                            Err(e) => {
                                tracing::error!(unit = %thread_name, "Failed to build runtime: {}", e);
                            }
                        }
                    })
                    .map_err(|source| SpawnError::Thread {
                        name: name.to_string(),
                        source,
                    })?;
                Ok(UnitHandle {
                    name: name.to_string(),
                    inner: UnitInner::Thread {
                        handle: Some(handle),
                        done,
                    },
                })
            }
        }
    }

    /// Create a queue; `capacity` of `None` means unbounded.
    pub fn queue<T>(&self, name: &str, capacity: Option<usize>) -> TaskQueue<T> {
        TaskQueue::new(name, capacity)
    }

    pub fn event(&self) -> Event {
        Event::new()
    }

    pub fn mutex<T>(&self, value: T) -> Arc<tokio::sync::Mutex<T>> {
        Arc::new(tokio::sync::Mutex::new(value))
    }
}

impl Default for Primitives {
    fn default() -> Self {
        Self::new(Flavor::default())
    }
}

/// Sets the completion event when a unit's thread unwinds or returns.
struct DoneGuard(Event);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

enum UnitInner {
    Task(Option<tokio::task::JoinHandle<()>>),
    Thread {
        handle: Option<std::thread::JoinHandle<()>>,
        done: Event,
    },
}

/// Handle to a spawned unit of execution.
pub struct UnitHandle {
    name: String,
    inner: UnitInner,
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl UnitHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            UnitInner::Task(handle) => handle.as_ref().is_none_or(|h| h.is_finished()),
            UnitInner::Thread { handle, .. } => handle.as_ref().is_none_or(|h| h.is_finished()),
        }
    }

    /// Wait for the unit to exit, up to `timeout` if given.
    ///
    /// Returns true once the unit has exited. A panic inside the unit is
    /// logged, not propagated.
    pub async fn join(&mut self, timeout: Option<Duration>) -> bool {
        match &mut self.inner {
            UnitInner::Task(slot) => {
                let Some(handle) = slot.as_mut() else {
                    return true;
                };
                let joined = match timeout {
                    Some(t) => match tokio::time::timeout(t, handle).await {
                        Ok(res) => res,
                        Err(_) => return false,
                    },
                    None => handle.await,
                };
                if let Err(e) = joined {
                    tracing::error!(unit = %self.name, "Unit terminated abnormally: {}", e);
                }
                *slot = None;
                true
            }
            UnitInner::Thread { handle, done } => {
                if handle.is_none() {
                    return true;
                }
                if !done.wait(timeout).await {
                    return false;
                }
                if let Some(h) = handle.take()
                    && h.join().is_err()
                {
                    tracing::error!(unit = %self.name, "Unit thread panicked");
                }
                true
            }
        }
    }
}

/// A cooperative flag that can be awaited with a bounded wait.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until the flag is set or `timeout` elapses. Returns the flag.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.is_set();
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// FIFO queue shared between producers and execution units.
pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    name: String,
    capacity: Option<usize>,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> TaskQueue<T> {
    pub fn new(name: &str, capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                capacity,
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Enqueue without blocking.
    pub fn try_push(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed {
                name: self.inner.name.clone(),
            });
        }
        {
            let mut items = self.items();
            if let Some(capacity) = self.inner.capacity
                && items.len() >= capacity
            {
                return Err(QueueError::Overflow {
                    name: self.inner.name.clone(),
                    capacity,
                });
            }
            items.push_back(item);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// Dequeue, waiting at most `wait` for an item to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.inner.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.items().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Refuse further pushes. Items already queued stay available.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavor_parse() {
        assert_eq!("shared".parse::<Flavor>().unwrap(), Flavor::SharedMemory);
        assert_eq!("Process".parse::<Flavor>().unwrap(), Flavor::IsolatedMemory);
        assert!("fiber".parse::<Flavor>().is_err());
    }

    #[test]
    fn bounded_queue_overflows() {
        let queue = TaskQueue::new("in", Some(2));
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert!(matches!(
            queue.try_push(3),
            Err(QueueError::Overflow { capacity: 2, .. })
        ));
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn closed_queue_rejects_push_keeps_items() {
        let queue = TaskQueue::new("in", None);
        queue.try_push("a").unwrap();
        queue.close();
        assert!(matches!(queue.try_push("b"), Err(QueueError::Closed { .. })));
        assert_eq!(queue.try_pop(), Some("a"));
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_idle() {
        let queue: TaskQueue<u8> = TaskQueue::new("in", None);
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn pop_timeout_wakes_on_push() {
        let queue = TaskQueue::new("in", None);
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.try_push(7u8).unwrap();
        });
        assert_eq!(queue.pop_timeout(Duration::from_secs(2)).await, Some(7));
    }

    #[tokio::test]
    async fn event_wait_times_out_then_sees_set() {
        let event = Event::new();
        assert!(!event.wait(Some(Duration::from_millis(10))).await);
        let setter = event.clone();
        tokio::spawn(async move { setter.set() });
        assert!(event.wait(Some(Duration::from_secs(2))).await);
    }

    #[tokio::test]
    async fn shared_unit_runs_and_joins() {
        let prims = Primitives::new(Flavor::SharedMemory);
        let flag = prims.event();
        let seen = flag.clone();
        let mut unit = prims.spawn("unit", move || async move { seen.set() }).unwrap();
        assert!(unit.join(Some(Duration::from_secs(2))).await);
        assert!(flag.is_set());
        assert!(unit.is_finished());
    }

    #[tokio::test]
    async fn isolated_unit_runs_on_own_thread() {
        let prims = Primitives::new(Flavor::IsolatedMemory);
        let queue = prims.queue("out", None);
        let tx = queue.clone();
        let mut unit = prims
            .spawn("isolated-unit", move || async move {
                let name = std::thread::current().name().map(String::from);
                let _ = tx.try_push(name);
            })
            .unwrap();
        assert!(unit.join(Some(Duration::from_secs(2))).await);
        assert_eq!(queue.try_pop(), Some(Some("isolated-unit".to_string())));
    }

    #[test]
    fn shared_spawn_without_runtime_fails() {
        let prims = Primitives::new(Flavor::SharedMemory);
        let err = prims.spawn("orphan", || async {}).unwrap_err();
        assert!(matches!(err, SpawnError::NoRuntime { .. }));
    }
}
