//! forkpool - a process-level task pool.
//!
//! Offloads `(target, args)` tasks from a parent program to a dynamic,
//! bounded set of long-lived worker subprocesses, each running the same
//! executable as the parent. The dispatcher rents an idle worker, sends the
//! task over the worker's stdin/stdout pipe pair as a length-prefixed frame,
//! and hands the decoded result (or propagated remote error) back to the
//! submitter.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │   (ForkPool)    │
//!                     └────────┬────────┘
//!                              │ framed pipes
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers are spawned lazily up to `max_procs`, rented FIFO so load
//! spreads, optionally recycled after `max_reqs` requests, and multiplex
//! concurrent in-flight requests by message id. Four submission surfaces
//! share the same core path: [`ForkPool::process`] (suspend until the
//! result), [`ForkPool::map`] (batch, input-order results),
//! [`ForkPool::defer`] (single-shot future handle) and [`ForkPool::queue`]
//! (fire-and-forget with callbacks).
//!
//! # Tasks travel by name
//!
//! A closure cannot be shipped through a pipe: the worker sees none of the
//! parent's memory. Register the work in a [`TaskRegistry`] under a name,
//! call [`init`] first thing in `main`, and submit the name plus arguments:
//!
//! ```no_run
//! use forkpool::{ForkPool, TaskRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> forkpool::Result<()> {
//!     let mut registry = TaskRegistry::new();
//!     registry.register("double", |args| {
//!         let n = args[0].as_i64().ok_or("expected an integer")?;
//!         Ok(json!(n * 2))
//!     });
//!     // In a pool-spawned child this never returns.
//!     forkpool::init(registry);
//!
//!     let pool = ForkPool::new();
//!     assert_eq!(pool.process("double", vec![json!(21)]).await?, json!(42));
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Registering by name also moves setup cost (imports, caches, connections)
//! into the worker, where it is paid once per process instead of once per
//! task.

#[cfg(not(unix))]
compile_error!(
    "forkpool drives workers over non-blocking pipe pairs and POSIX signals; \
     only Unix platforms are supported"
);

mod codec;
mod dispatcher;
mod error;
mod ipc;
pub mod logging;
mod pool;
mod protocol;
mod registry;
mod worker;
mod worker_main;

pub use codec::{Codec, JsonCodec};
pub use dispatcher::{Deferred, ErrorFn, ForkPool, SuccessFn};
pub use error::{PoolError, Result};
pub use pool::{PoolConfig, PoolStats, WorkerCommand, default_max_procs};
pub use protocol::{Request, Response, ResponseStatus, TaskTarget};
pub use registry::{CallableFn, TaskFn, TaskRegistry};
pub use worker_main::{WORKER_ENV, init, init_with_codec};
