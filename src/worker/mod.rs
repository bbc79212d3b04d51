//! Background execution.
//!
//! Core components:
//! - `state`: worker lifecycle (Idle → Running → Stopped)
//! - `worker`: one execution loop between an input and an output queue
//! - `keyed`: worker whose results are fetched by submission key
//! - `pool`: elastic set of ephemeral workers over one shared queue
//! - `schedule`: five-field calendar patterns
//! - `scheduler`: periodic trigger for a bound task
//! - `async_call`: fire-and-forget invocation of one callable

pub mod async_call;
pub mod keyed;
pub mod pool;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use async_call::AsyncCall;
pub use keyed::KeyedWorker;
pub use pool::Pool;
pub use schedule::{Field, ScheduleEntry};
pub use scheduler::Scheduler;
pub use state::WorkerState;
pub use worker::Worker;
