//! taskcore: concurrent task-execution core.
//!
//! Background workers, keyed workers, an elastic pool and a cron-style
//! scheduler, all built on one flavor-agnostic primitive set.

pub mod config;
pub mod context;
pub mod error;
pub mod payload;
pub mod primitives;
pub mod registry;
pub mod task;
pub mod worker;

pub use config::{PoolConfig, SchedulerConfig, ShellConfig, WorkerConfig};
pub use context::ExecContext;
pub use error::{Error, Result, TaskError};
pub use payload::{Args, Payload};
pub use primitives::Flavor;
pub use registry::Registry;
pub use task::{Callable, Operand, Outcome, SymbolicCall, Task, TaskResult};
pub use worker::{AsyncCall, KeyedWorker, Pool, ScheduleEntry, Scheduler, Worker, WorkerState};
