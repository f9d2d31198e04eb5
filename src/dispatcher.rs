//! Public submission surface over the pool.
//!
//! All four submission modes funnel through the same two steps: `start_task`
//! (checkout a worker, send, record the message id in the pending table) and
//! `collect_task` (suspend on the response, then check the worker back in).
//! A worker stays rented until its result arrives, so a busy pool makes
//! later submitters spawn fresh workers up to the cap; that is what lets
//! `map` saturate the pool, and what gives the acquire timeout something
//! real to race against. Responses are still correlated by message id
//! through each worker's slot table, so a response landing before the
//! collector gets to `recv` is parked, not lost.

use crate::error::{PoolError, Result};
use crate::pool::{Pool, PoolConfig, PoolStats};
use crate::protocol::TaskTarget;
use crate::worker::Worker;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Callback invoked with the task value by [`ForkPool::queue`].
pub type SuccessFn = Box<dyn FnOnce(Value) + Send + 'static>;

/// Callback invoked with the task error by [`ForkPool::queue`].
pub type ErrorFn = Box<dyn FnOnce(PoolError) + Send + 'static>;

/// A process-level task pool.
///
/// Submits `(target, args)` tasks to a bounded set of long-lived worker
/// subprocesses and hands the decoded results back to the submitter. Cheap
/// to clone; clones share the same pool.
///
/// ```no_run
/// # async fn demo() -> forkpool::Result<()> {
/// use forkpool::ForkPool;
/// use serde_json::json;
///
/// let pool = ForkPool::new();
/// let answer = pool.process("double", vec![json!(21)]).await?;
/// assert_eq!(answer, json!(42));
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ForkPool {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    /// Routes each in-flight message id back to the worker that holds it.
    pending: Mutex<HashMap<u64, Worker>>,
}

/// Returns a rented worker to the pool when the renting future bails out
/// early: a send failure, or the submitter being dropped while parked in
/// `send` or `recv`. Without this, a cancelled submission would strand its
/// worker and `shutdown` could never drain.
struct CheckoutGuard<'a> {
    pool: &'a Pool,
    worker: Option<Worker>,
}

impl CheckoutGuard<'_> {
    fn disarm(&mut self) -> Worker {
        self.worker.take().expect("checkout guard already disarmed")
    }
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.checkin(&worker);
        }
    }
}

impl ForkPool {
    /// Create a pool with default configuration (`max_procs` = CPU count,
    /// no recycling, workers run the parent's own executable).
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default()).expect("default pool config is valid")
    }

    /// Create a pool with the given configuration.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                pool: Pool::new(config)?,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Run one task and suspend until its result. Re-raises remote task
    /// failures as [`PoolError::Task`].
    pub async fn process(&self, target: impl Into<TaskTarget>, args: Vec<Value>) -> Result<Value> {
        let msgid = self.inner.start_task(target.into(), args, None).await?;
        self.inner.collect_task(msgid).await
    }

    /// As [`process`](Self::process), but give up with
    /// [`PoolError::CheckoutTimeout`] if no worker becomes available within
    /// `acquire_timeout`. The timeout covers worker acquisition only, never
    /// the task itself.
    pub async fn process_timeout(
        &self,
        target: impl Into<TaskTarget>,
        args: Vec<Value>,
        acquire_timeout: Duration,
    ) -> Result<Value> {
        let msgid = self
            .inner
            .start_task(target.into(), args, Some(acquire_timeout))
            .await?;
        self.inner.collect_task(msgid).await
    }

    /// Run the task once per input, pipelining across the pool, and return
    /// the results in input order regardless of completion order. A task
    /// result that is a sequence is flattened into the output in place.
    pub async fn map(
        &self,
        target: impl Into<TaskTarget>,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let target = target.into();

        // Submit everything first so up to `max_procs` workers saturate,
        // then collect in input order.
        let mut deferred = Vec::with_capacity(inputs.len());
        for input in inputs {
            deferred.push(self.defer(target.clone(), vec![input]).await?);
        }

        let mut results = Vec::with_capacity(deferred.len());
        for handle in deferred {
            match handle.wait().await? {
                Value::Array(items) => results.extend(items),
                value => results.push(value),
            }
        }
        Ok(results)
    }

    /// Submit a task and return a single-shot handle to its eventual
    /// outcome. The send is on the wire (and ordered with respect to the
    /// caller) by the time this returns.
    pub async fn defer(&self, target: impl Into<TaskTarget>, args: Vec<Value>) -> Result<Deferred> {
        let msgid = self.inner.start_task(target.into(), args, None).await?;

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.collect_task(msgid).await;
            // A dropped handle just means nobody wants the answer.
            let _ = tx.send(outcome);
        });
        Ok(Deferred { rx })
    }

    /// Submit a task whose outcome is delivered to callbacks instead of a
    /// handle. Returns once the send has been accepted. With the relevant
    /// callback absent the outcome is dropped.
    pub async fn queue(
        &self,
        target: impl Into<TaskTarget>,
        args: Vec<Value>,
        on_success: Option<SuccessFn>,
        on_error: Option<ErrorFn>,
    ) -> Result<()> {
        let msgid = self.inner.start_task(target.into(), args, None).await?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.collect_task(msgid).await {
                Ok(value) => match on_success {
                    Some(callback) => callback(value),
                    None => debug!(msgid, "queued task succeeded with no callback"),
                },
                Err(error) => match on_error {
                    Some(callback) => callback(error),
                    None => debug!(msgid, %error, "queued task failed with no callback"),
                },
            }
        });
        Ok(())
    }

    /// Stop the pool: refuse new submissions while draining, kill idle
    /// workers immediately, and wait for checked-out workers to be returned
    /// before killing them too. A worker is returned when its in-flight
    /// task completes (with a value, a remote failure, or a dead worker),
    /// so this suspends until every outstanding task has run its course and
    /// every child is reaped. The pool is reusable afterwards and behaves
    /// as freshly constructed.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;

        // The drain above cannot finish before every pending worker was
        // checked back in, which removes its entry. Anything left would be
        // an accounting bug, not a live task.
        let mut pending = self.inner.pending.lock().expect("pending table poisoned");
        if !pending.is_empty() {
            warn!(stranded = pending.len(), "pending table not empty after drain");
            pending.clear();
        }
    }

    /// Current idle-queue size.
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Point-in-time pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

impl Default for ForkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ForkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ForkPool")
            .field("live", &stats.live)
            .field("idle", &stats.idle)
            .field("max_procs", &stats.max_procs)
            .finish()
    }
}

impl Inner {
    /// Checkout a worker, put one task on the wire, and record the message
    /// id in the pending table. The worker stays checked out until
    /// `collect_task` returns it. If the send fails the guard returns the
    /// worker before the error surfaces.
    async fn start_task(
        &self,
        target: TaskTarget,
        args: Vec<Value>,
        acquire_timeout: Option<Duration>,
    ) -> Result<u64> {
        target.validate()?;

        let worker = self.pool.checkout(acquire_timeout).await?;
        let mut guard = CheckoutGuard {
            pool: &self.pool,
            worker: Some(worker),
        };

        let worker_ref = guard.worker.as_ref().expect("guard holds worker");
        let msgid = worker_ref.send(&target, &args).await?;

        let worker = guard.disarm();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(msgid, worker);
        Ok(msgid)
    }

    /// Suspend until the response for `msgid`, then check its worker back
    /// in. The checkin happens whatever the outcome: a remote task failure
    /// returns the worker to the pool before the error surfaces, and a dead
    /// worker is disposed of by `checkin` itself.
    async fn collect_task(&self, msgid: u64) -> Result<Value> {
        let worker = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(&msgid)
            .ok_or(PoolError::UnknownMsgId(msgid))?;

        let mut guard = CheckoutGuard {
            pool: &self.pool,
            worker: Some(worker),
        };
        let worker_ref = guard.worker.as_ref().expect("guard holds worker");
        let outcome = worker_ref.recv(msgid).await;

        let worker = guard.disarm();
        self.pool.checkin(&worker);
        outcome
    }
}

/// Handle to a deferred task: a single-shot signal that yields the task's
/// value or re-raises its captured error.
#[derive(Debug)]
pub struct Deferred {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Deferred {
    /// Suspend until the task's outcome is available.
    pub async fn wait(self) -> Result<Value> {
        // The sender is dropped without sending only if the collector task
        // dies with the runtime; treat that like a dead worker.
        self.rx.await.unwrap_or(Err(PoolError::WorkerDead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_target_rejected_before_checkout() {
        let pool = ForkPool::new();
        let err = pool.process("", vec![]).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidArg(_)));
        // Validation failed before any worker was touched.
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_map_of_nothing_spawns_nothing() {
        let pool = ForkPool::new();
        let results = pool.map("double", vec![]).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_collect_unknown_msgid() {
        let pool = ForkPool::new();
        let err = pool.inner.collect_task(999).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownMsgId(999)));
    }

    #[tokio::test]
    async fn test_capacity_starts_empty() {
        let pool = ForkPool::new();
        assert_eq!(pool.capacity(), 0);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.total_spawned, 0);
    }
}
