//! Worker addressable by submission key.
//!
//! The caller picks a key per submission and later asks for "the result of
//! this key" instead of reading the output stream in order.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::config::WorkerConfig;
use crate::context::ExecContext;
use crate::error::{KeyedError, Result};
use crate::task::{Outcome, Task};
use crate::worker::state::WorkerState;
use crate::worker::worker::{Submission, Worker};

#[derive(Debug, Default)]
struct Ledger {
    /// Keys submitted whose result has not been collected yet.
    outstanding: Vec<String>,
    /// Results collected from the worker but not yet handed out.
    buffered: HashMap<String, Outcome>,
}

pub struct KeyedWorker {
    worker: Worker,
    ledger: Mutex<Ledger>,
}

impl KeyedWorker {
    pub fn new(config: WorkerConfig, ctx: &ExecContext) -> Self {
        Self {
            worker: Worker::new(config, ctx),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit `task` under `key`.
    ///
    /// The key is recorded before the task is queued, under the ledger lock,
    /// so a concurrent `collect` never sees a result for an unrecorded key.
    pub fn submit(&self, key: impl Into<String>, task: Task) -> Result<()> {
        let key = key.into();
        let mut ledger = self.ledger();
        ledger.outstanding.push(key.clone());
        if let Err(e) = self.worker.enqueue(Submission {
            task,
            key: Some(key),
        }) {
            ledger.outstanding.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Submit `task` keyed by its own text form, returning that key.
    pub fn put(&self, task: Task) -> Result<String> {
        let key = task.to_string();
        self.submit(key.clone(), task)?;
        Ok(key)
    }

    /// Move newly finished results into the buffer.
    fn collect(&self, ledger: &mut Ledger) {
        for result in self.worker.drain_all() {
            let key = result.key.unwrap_or_else(|| result.task.to_string());
            if let Some(pos) = ledger.outstanding.iter().position(|k| *k == key) {
                ledger.outstanding.remove(pos);
            }
            ledger.buffered.insert(key, result.outcome);
        }
    }

    /// Take the outcome for `key`. Each outcome is handed out once.
    pub fn get(&self, key: &str) -> std::result::Result<Outcome, KeyedError> {
        let mut ledger = self.ledger();
        self.collect(&mut ledger);
        ledger.buffered.remove(key).ok_or_else(|| KeyedError::NotReady {
            key: key.to_string(),
        })
    }

    /// Take every buffered and newly finished outcome, forgetting all
    /// outstanding keys.
    pub fn flush(&self) -> Vec<(String, Outcome)> {
        let mut ledger = self.ledger();
        self.collect(&mut ledger);
        ledger.outstanding.clear();
        ledger.buffered.drain().collect()
    }

    /// True when every submitted key has produced its outcome.
    pub fn is_idle(&self) -> bool {
        let mut ledger = self.ledger();
        self.collect(&mut ledger);
        ledger.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> Vec<String> {
        self.ledger().outstanding.clone()
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    pub async fn stop(&self) {
        self.worker.stop().await
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    pub fn pending(&self) -> usize {
        self.worker.pending()
    }
}

impl std::fmt::Debug for KeyedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedWorker")
            .field("worker", &self.worker)
            .field("outstanding", &self.ledger().outstanding.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::payload::Payload;

    async fn wait_idle(worker: &KeyedWorker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !worker.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("keyed worker never went idle");
    }

    #[tokio::test]
    async fn get_hands_out_once() {
        let ctx = ExecContext::default();
        let worker = KeyedWorker::new(WorkerConfig::new("keyed"), &ctx);
        worker.start().unwrap();
        worker.submit("k1", Task::expr("6 * 7")).unwrap();
        assert!(!worker.is_idle());
        wait_idle(&worker).await;

        assert_eq!(worker.get("k1").unwrap(), Ok(Payload::Int(42)));
        assert!(matches!(worker.get("k1"), Err(KeyedError::NotReady { .. })));
        worker.stop().await;
    }

    #[tokio::test]
    async fn unknown_key_is_not_ready() {
        let ctx = ExecContext::default();
        let worker = KeyedWorker::new(WorkerConfig::new("keyed"), &ctx);
        assert!(matches!(
            worker.get("missing"),
            Err(KeyedError::NotReady { key }) if key == "missing"
        ));
    }

    #[tokio::test]
    async fn flush_returns_all_and_clears_outstanding() {
        let ctx = ExecContext::default();
        let worker = KeyedWorker::new(WorkerConfig::new("keyed"), &ctx);
        let key = worker.put(Task::expr("1 + 1")).unwrap();
        assert_eq!(key, "1 + 1");
        worker.submit("later", Task::expr("2 + 2")).unwrap();
        assert_eq!(worker.outstanding().len(), 2);

        // Not started: nothing finished, but flush forgets the keys anyway.
        assert!(worker.flush().is_empty());
        assert!(worker.is_idle());

        worker.start().unwrap();
        let mut flushed = tokio::time::timeout(Duration::from_secs(5), async {
            let mut all = Vec::new();
            while all.len() < 2 {
                all.extend(worker.flush());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            all
        })
        .await
        .unwrap();
        flushed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            flushed,
            vec![
                ("1 + 1".to_string(), Ok(Payload::Int(2))),
                ("later".to_string(), Ok(Payload::Int(4))),
            ]
        );
        worker.stop().await;
    }

    #[tokio::test]
    async fn concurrent_polling_never_strands_a_key() {
        let ctx = ExecContext::default();
        let worker = Arc::new(KeyedWorker::new(WorkerConfig::new("keyed"), &ctx));
        worker.start().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let poller = {
            let worker = Arc::clone(&worker);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    worker.is_idle();
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..200 {
            worker.submit(format!("k{i}"), Task::expr(format!("{i} + 0"))).unwrap();
            if i % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        wait_idle(&worker).await;
        done.store(true, Ordering::SeqCst);
        poller.await.unwrap();

        for i in 0..200 {
            assert_eq!(worker.get(&format!("k{i}")).unwrap(), Ok(Payload::Int(i)));
        }
        worker.stop().await;
    }

    #[tokio::test]
    async fn refused_submission_leaves_no_key() {
        let ctx = ExecContext::default();
        let worker = KeyedWorker::new(WorkerConfig::new("keyed"), &ctx);
        worker.start().unwrap();
        worker.stop().await;
        assert!(worker.submit("late", Task::expr("1")).is_err());
        assert!(worker.outstanding().is_empty());
        assert!(worker.is_idle());
    }
}
