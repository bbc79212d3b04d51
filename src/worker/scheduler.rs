//! Cron-style trigger.
//!
//! Once per tick the loop compares local wall-clock time against a
//! [`ScheduleEntry`]; on the first tick of a matching minute it runs the
//! bound task and keeps its result in a bounded history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::context::ExecContext;
use crate::error::{Result, ScheduleError};
use crate::primitives::{Event, Primitives, UnitHandle};
use crate::registry::builtin::ShellCommand;
use crate::task::{Outcome, Resolver, Task, TaskResult, catch_fault};
use crate::worker::schedule::ScheduleEntry;

/// State shared between the trigger loop and direct callers.
struct Shared {
    entry: Mutex<ScheduleEntry>,
    task: Task,
    resolver: tokio::sync::Mutex<Resolver>,
    history: Mutex<VecDeque<TaskResult>>,
    keep: usize,
    trace: bool,
}

impl Shared {
    fn line(&self) -> String {
        self.entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .line()
            .to_string()
    }

    /// Run the bound task once and keep its result.
    async fn fire(&self) -> Outcome {
        let line = self.line();
        if self.trace {
            tracing::debug!(schedule = %line, task = %self.task, "Running scheduled task");
        }
        let outcome = catch_fault(async {
            let mut resolver = self.resolver.lock().await;
            resolver.execute(&self.task).await
        })
        .await;
        if self.trace
            && let Ok(value) = &outcome
        {
            tracing::debug!(schedule = %line, "=> {}", value);
        }
        if self.keep > 0 {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            while history.len() >= self.keep {
                history.pop_front();
            }
            history.push_back(TaskResult {
                task: self.task.clone(),
                key: None,
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    /// Check the schedule against local time.
    fn due(&self) -> bool {
        let now = Local::now().naive_local();
        let mut entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        entry.changed(&now) && entry.matches(&now)
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    primitives: Primitives,
    shared: Arc<Shared>,
    stop: Event,
    unit: Mutex<Option<UnitHandle>>,
}

impl Scheduler {
    /// Bind a schedule line to a task.
    ///
    /// An explicit `task` wins. Otherwise the text after the calendar fields
    /// becomes an external command run through the context's runner.
    pub fn new(
        line: &str,
        task: Option<Task>,
        config: SchedulerConfig,
        ctx: &ExecContext,
    ) -> std::result::Result<Self, ScheduleError> {
        let entry = ScheduleEntry::parse(line)?;
        let task = match (task, &entry.task_text) {
            (Some(task), _) => task,
            (None, Some(text)) => {
                Task::call(ShellCommand::callable(Arc::clone(ctx.runner()), text.clone()))
            }
            (None, None) => {
                return Err(ScheduleError::NoTask {
                    line: line.to_string(),
                });
            }
        };
        let primitives = Primitives::new(config.flavor);
        let resolver = Resolver::new(Arc::clone(ctx.registry()), primitives.crosses_boundary())
            .with_trace(config.trace);
        let shared = Arc::new(Shared {
            entry: Mutex::new(entry),
            task,
            resolver: tokio::sync::Mutex::new(resolver),
            history: Mutex::new(VecDeque::new()),
            keep: config.keep,
            trace: config.trace,
        });
        Ok(Self {
            stop: primitives.event(),
            primitives,
            shared,
            config,
            unit: Mutex::new(None),
        })
    }

    pub fn line(&self) -> String {
        self.shared.line()
    }

    pub fn task(&self) -> &Task {
        &self.shared.task
    }

    /// Spawn the trigger loop, restarting it if it is already running.
    pub async fn start(&self) -> Result<()> {
        if self.is_alive() {
            self.stop().await;
        }
        self.stop.clear();
        let shared = Arc::clone(&self.shared);
        let stop = self.stop.clone();
        let tick = self.config.tick;
        let unit_name = format!("scheduler-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let unit = self
            .primitives
            .spawn(&unit_name, move || run_trigger(shared, stop, tick))?;
        *self.unit.lock().unwrap_or_else(PoisonError::into_inner) = Some(unit);
        Ok(())
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.stop.set();
        let unit = self.unit.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut unit) = unit {
            unit.join(None).await;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|unit| !unit.is_finished())
    }

    /// Run the bound task now, regardless of the schedule.
    pub async fn run_now(&self) -> Outcome {
        self.shared.fire().await
    }

    /// Take the oldest kept result.
    pub fn pop_result(&self) -> Option<TaskResult> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Kept results, oldest first.
    pub fn history(&self) -> Vec<TaskResult> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("line", &self.line())
            .field("flavor", &self.config.flavor)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.set();
    }
}

async fn run_trigger(shared: Arc<Shared>, stop: Event, tick: std::time::Duration) {
    let line = shared.line();
    tracing::info!("Scheduler '{}' started", line);
    while !stop.is_set() {
        if shared.due()
            && let Err(e) = shared.fire().await
        {
            tracing::warn!(schedule = %line, "Scheduled task failed: {}", e);
        }
        stop.wait(Some(tick)).await;
    }
    tracing::info!("Scheduler '{}' finished", line);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::TaskError;
    use crate::payload::Payload;
    use crate::primitives::Flavor;
    use crate::task::Callable;

    fn counter() -> (Arc<AtomicUsize>, Task) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = Task::call(Callable::new("tick", move |_| {
            Ok(Payload::from(seen.fetch_add(1, Ordering::SeqCst) + 1))
        }));
        (count, task)
    }

    #[test]
    fn needs_a_task() {
        let ctx = ExecContext::default();
        let err = Scheduler::new("* * * * *", None, SchedulerConfig::default(), &ctx).unwrap_err();
        assert!(matches!(err, ScheduleError::NoTask { .. }));
        assert!(matches!(
            Scheduler::new("* *", None, SchedulerConfig::default(), &ctx),
            Err(ScheduleError::Malformed { found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn history_keeps_newest() {
        let ctx = ExecContext::default();
        let (_, task) = counter();
        let sched = Scheduler::new(
            "0 0 1 1 *",
            Some(task),
            SchedulerConfig::default().with_keep(2),
            &ctx,
        )
        .unwrap();
        for _ in 0..3 {
            sched.run_now().await.unwrap();
        }
        let kept: Vec<_> = sched.history().iter().filter_map(|r| r.value().cloned()).collect();
        assert_eq!(kept, vec![Payload::Int(2), Payload::Int(3)]);
        assert_eq!(sched.pop_result().and_then(|r| r.value().cloned()), Some(Payload::Int(2)));
        assert_eq!(sched.history().len(), 1);
    }

    #[tokio::test]
    async fn keep_zero_stores_nothing() {
        let ctx = ExecContext::default();
        let (_, task) = counter();
        let sched = Scheduler::new(
            "* * * * *",
            Some(task),
            SchedulerConfig::default().with_keep(0),
            &ctx,
        )
        .unwrap();
        assert_eq!(sched.run_now().await, Ok(Payload::Int(1)));
        assert!(sched.pop_result().is_none());
    }

    #[tokio::test]
    async fn fires_once_per_matching_minute() {
        let ctx = ExecContext::default();
        let (count, task) = counter();
        let sched = Scheduler::new(
            "* * * * *",
            Some(task),
            SchedulerConfig::default().with_tick(Duration::from_millis(10)),
            &ctx,
        )
        .unwrap();
        sched.start().await.unwrap();
        assert!(sched.is_alive());
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A minute boundary may fall inside the window.
        assert!(count.load(Ordering::SeqCst) <= 2);

        sched.start().await.unwrap();
        assert!(sched.is_alive());
        sched.stop().await;
        assert!(!sched.is_alive());
    }

    #[tokio::test]
    async fn text_task_runs_as_command() {
        let ctx = ExecContext::default();
        let sched = Scheduler::new(
            "* * * * * echo scheduled",
            None,
            SchedulerConfig::default(),
            &ctx,
        )
        .unwrap();
        let value = sched.run_now().await.unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("output"), Some(&Payload::from("scheduled\n")));
        assert_eq!(map.get("success"), Some(&Payload::Bool(true)));
    }

    #[tokio::test]
    async fn faults_are_kept_not_raised() {
        let ctx = ExecContext::default();
        let sched = Scheduler::new(
            "* * * * *",
            Some(Task::call(Callable::new("bad", |_| Err(TaskError::fault("nope"))))),
            SchedulerConfig::default().with_flavor(Flavor::IsolatedMemory),
            &ctx,
        )
        .unwrap();
        assert!(sched.run_now().await.is_err());
        assert!(sched.pop_result().is_some_and(|r| r.error().is_some()));
    }

    fn unit_name(sched: &Scheduler) -> Option<String> {
        sched
            .unit
            .lock()
            .unwrap()
            .as_ref()
            .map(|unit| unit.name().to_string())
    }

    #[tokio::test]
    async fn units_have_distinct_names() {
        let ctx = ExecContext::default();
        let (_, first_task) = counter();
        let (_, second_task) = counter();
        let first =
            Scheduler::new("0 0 1 1 *", Some(first_task), SchedulerConfig::default(), &ctx).unwrap();
        let second =
            Scheduler::new("0 0 1 1 *", Some(second_task), SchedulerConfig::default(), &ctx).unwrap();
        first.start().await.unwrap();
        second.start().await.unwrap();

        let (a, b) = (unit_name(&first).unwrap(), unit_name(&second).unwrap());
        assert!(a.starts_with("scheduler-"));
        assert_ne!(a, b);
        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn dropping_a_started_scheduler_ends_its_loop() {
        for flavor in [Flavor::SharedMemory, Flavor::IsolatedMemory] {
            let ctx = ExecContext::default();
            let (_, task) = counter();
            let sched = Scheduler::new(
                "0 0 1 1 *",
                Some(task),
                SchedulerConfig::default()
                    .with_flavor(flavor)
                    .with_tick(Duration::from_secs(30)),
                &ctx,
            )
            .unwrap();
            sched.start().await.unwrap();
            let mut unit = sched.unit.lock().unwrap().take().unwrap();
            drop(sched);
            assert!(unit.join(Some(Duration::from_secs(5))).await);
        }
    }
}
