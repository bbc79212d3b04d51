//! End-to-end tests for workers, keyed workers, pools, schedules and async
//! calls, run against both execution flavors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;

use taskcore::error::{KeyedError, QueueError};
use taskcore::registry::Namespace;
use taskcore::{
    Args, AsyncCall, Callable, Error, ExecContext, Flavor, KeyedWorker, Payload, Pool, PoolConfig,
    Registry, ScheduleEntry, SymbolicCall, Task, TaskError, TaskResult, Worker, WorkerConfig,
};

const FLAVORS: [Flavor; 2] = [Flavor::SharedMemory, Flavor::IsolatedMemory];

async fn collect(worker: &Worker, count: usize) -> Vec<TaskResult> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut results = Vec::new();
        while results.len() < count {
            match worker.pull() {
                Some(result) => results.push(result),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        results
    })
    .await
    .expect("timed out waiting for results")
}

fn started_worker(ctx: &ExecContext, name: &str, flavor: Flavor) -> Worker {
    let worker = Worker::new(WorkerConfig::new(name).with_flavor(flavor), ctx);
    worker.start().unwrap();
    worker
}

#[tokio::test]
async fn direct_callable_yields_value() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let worker = started_worker(&ctx, "direct", flavor);
        let task = Task::call(Callable::new("answer", |_| Ok(Payload::Int(42))));
        worker.submit(task).unwrap();

        let results = collect(&worker, 1).await;
        assert_eq!(results[0].task.to_string(), "<callable answer>");
        assert_eq!(results[0].outcome, Ok(Payload::Int(42)));
        worker.stop().await;
    }
}

#[tokio::test]
async fn symbolic_call_on_builtin_class() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let worker = started_worker(&ctx, "symbolic", flavor);
        let call = SymbolicCall::new("upper")
            .class("text", vec![Payload::from("abc")])
            .args(Args::Keyword(BTreeMap::new()));
        worker.submit(call.into()).unwrap();

        let results = collect(&worker, 1).await;
        assert_eq!(results[0].outcome, Ok(Payload::from("ABC")));
        worker.stop().await;
    }
}

#[test]
fn wildcard_schedule_matches_once_per_minute() {
    let mut entry = ScheduleEntry::parse("* * * * * noop").unwrap();
    let now = NaiveDate::from_ymd_opt(2025, 6, 1)
        .unwrap()
        .and_hms_opt(8, 15, 30)
        .unwrap();
    assert!(entry.matches(&now));
    assert!(!entry.changed(&now));
    assert!(entry.changed(&(now + chrono::Duration::seconds(30))));
}

#[tokio::test]
async fn pool_never_exceeds_ceiling() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let pool = Pool::new(
            PoolConfig::default().with_flavor(flavor).with_max_workers(2),
            &ctx,
        );
        pool.start().await.unwrap();
        for _ in 0..5 {
            pool.submit(Task::call(Callable::new("nap", |_| {
                std::thread::sleep(Duration::from_millis(30));
                Ok(Payload::None)
            })))
            .await
            .unwrap();
            assert!(pool.worker_count().await <= 2);
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            while !pool.pending().await.is_empty() {
                assert!(pool.worker_count().await <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool never drained");
        pool.stop().await;
        assert_eq!(pool.worker_count().await, 0);
    }
}

#[tokio::test]
async fn keyed_get_hands_out_once() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let worker = KeyedWorker::new(WorkerConfig::new("keyed").with_flavor(flavor), &ctx);
        worker.start().unwrap();
        worker.submit("k1", Task::expr("sum([1, 2, 3]) * 2")).unwrap();

        let value = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match worker.get("k1") {
                    Ok(outcome) => return outcome,
                    Err(KeyedError::NotReady { .. }) => {
                        tokio::time::sleep(Duration::from_millis(5)).await
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, Ok(Payload::Int(12)));
        assert!(matches!(worker.get("k1"), Err(KeyedError::NotReady { .. })));
        assert!(worker.is_idle());
        worker.stop().await;
    }
}

#[tokio::test]
async fn unknown_target_fails_and_worker_continues() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let worker = started_worker(&ctx, "unknown", flavor);
        worker.submit(SymbolicCall::new("frobnicate").into()).unwrap();
        worker.submit(Task::expr("1 + 1")).unwrap();

        let results = collect(&worker, 2).await;
        assert_eq!(
            results[0].outcome,
            Err(TaskError::MethodNotFound {
                target: "frobnicate".to_string()
            })
        );
        assert_eq!(results[1].outcome, Ok(Payload::Int(2)));
        worker.stop().await;
    }
}

#[tokio::test]
async fn results_keep_submission_order() {
    let ctx = ExecContext::default();
    for flavor in FLAVORS {
        let worker = started_worker(&ctx, "ordered", flavor);
        let tasks: Vec<String> = (0..25).map(|i| format!("{i} * 10")).collect();
        for text in &tasks {
            worker.submit(Task::expr(text.clone())).unwrap();
        }
        let results = collect(&worker, tasks.len()).await;
        let seen: Vec<String> = results.iter().map(|r| r.task.to_string()).collect();
        assert_eq!(seen, tasks);
        worker.stop().await;
        assert!(matches!(
            worker.submit(Task::expr("1")),
            Err(Error::Queue(QueueError::Closed { .. }))
        ));
    }
}

#[tokio::test]
async fn namespaces_and_locals_persist_per_worker() {
    let mut registry = Registry::new();
    registry.register_namespace(
        Namespace::new("geometry")
            .value("unit", 1)
            .function("square", |args| {
                let n = args.get(0, "n").and_then(Payload::as_i64).unwrap_or(0);
                Ok(Payload::Int(n * n))
            }),
    );
    let ctx = ExecContext::new(registry);
    for flavor in FLAVORS {
        let worker = started_worker(&ctx, "namespaces", flavor);
        for text in ["import geometry", "side = geometry.square(4)", "side + geometry.unit"] {
            worker.submit(Task::expr(text)).unwrap();
        }
        let outcomes: Vec<_> = collect(&worker, 3).await.into_iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                Ok(Payload::from("geometry")),
                Ok(Payload::from("side")),
                Ok(Payload::Int(17)),
            ]
        );
        worker.stop().await;
    }
}

#[tokio::test]
async fn async_call_fault_observed_after_completion() {
    for flavor in FLAVORS {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        let call = AsyncCall::run(
            flavor,
            Callable::new("fails", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::fault("disk on fire"))
            }),
        )
        .unwrap();
        assert!(call.wait(Some(Duration::from_secs(10))).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(
            call.take_outcome(),
            Some(Err(TaskError::ExecutionFault(msg))) if msg == "disk on fire"
        ));
    }
}
