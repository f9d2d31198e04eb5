//! Bounded pool of worker subprocesses.
//!
//! Idle workers sit in a FIFO queue so load spreads across the pool instead
//! of hammering one hot worker. Workers are spawned lazily: only when a
//! submitter arrives, no idle worker exists, and the cap permits. Spawning
//! is expensive (fork plus the host's startup imports), so the pool never
//! pre-spawns and never spawns speculatively.

use crate::codec::{Codec, JsonCodec};
use crate::error::{PoolError, Result};
use crate::worker::Worker;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Poll interval while draining the pool at shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How to launch worker subprocesses.
///
/// By default the pool re-executes the parent's own binary, relying on
/// [`crate::init`] in the host's `main` to divert the child into the worker
/// loop. Point it elsewhere to use a dedicated worker executable.
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    /// Program to execute; `None` means the current executable.
    program: Option<PathBuf>,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Launch the parent's own executable (the default).
    pub fn current_exe() -> Self {
        Self::default()
    }

    /// Launch a specific program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub(crate) fn args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub(crate) fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe()
                .map_err(|e| PoolError::Spawn(format!("cannot resolve current executable: {}", e))),
        }
    }
}

/// Configuration for the pool.
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of live workers. Defaults to the CPU count.
    pub max_procs: usize,
    /// Recycle a worker once it has been sent this many requests.
    /// `0` means never recycle.
    pub max_reqs: u64,
    /// How to launch workers.
    pub worker: WorkerCommand,
    /// Payload serialization; must match the worker side.
    pub codec: Arc<dyn Codec>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_procs: default_max_procs(),
            max_reqs: 0,
            worker: WorkerCommand::current_exe(),
            codec: Arc::new(JsonCodec),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    pub fn with_max_reqs(mut self, max_reqs: u64) -> Self {
        self.max_reqs = max_reqs;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_procs", &self.max_procs)
            .field("max_reqs", &self.max_reqs)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Default worker cap: one per CPU.
pub fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured worker cap.
    pub max_procs: usize,
    /// Live workers (idle plus checked out).
    pub live: usize,
    /// Workers currently idle in the queue.
    pub idle: usize,
    /// Workers spawned over the pool's lifetime.
    pub total_spawned: u64,
    /// Workers recycled for reaching `max_reqs`.
    pub total_recycled: u64,
}

/// Bounded multiset of workers exposed as a checkout/checkin protocol.
#[derive(Clone)]
pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: PoolConfig,
    /// FIFO of idle workers. Pushes at the tail, takes from the head.
    idle: std::sync::Mutex<VecDeque<Worker>>,
    /// Wakes parked takers after a checkin (and at shutdown, so they can
    /// observe `stopping`).
    idle_notify: Notify,
    num_procs: AtomicUsize,
    next_worker_id: AtomicUsize,
    /// True only while a shutdown is draining; submissions arriving then
    /// fail with `PoolStopped`. Cleared when the drain completes, so the
    /// pool is reusable afterwards.
    stopping: AtomicBool,
    /// In-flight worker teardowns, awaited at shutdown so children are
    /// actually reaped before `shutdown` returns.
    teardowns: std::sync::Mutex<Vec<JoinHandle<()>>>,
    total_spawned: AtomicU64,
    total_recycled: AtomicU64,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig) -> Result<Self> {
        if config.max_procs == 0 {
            return Err(PoolError::InvalidArg("max_procs must be at least 1".into()));
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                idle: std::sync::Mutex::new(VecDeque::new()),
                idle_notify: Notify::new(),
                num_procs: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                teardowns: std::sync::Mutex::new(Vec::new()),
                total_spawned: AtomicU64::new(0),
                total_recycled: AtomicU64::new(0),
            }),
        })
    }

    /// Current idle-queue size.
    pub(crate) fn capacity(&self) -> usize {
        self.shared.idle.lock().expect("idle queue poisoned").len()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let s = &self.shared;
        PoolStats {
            max_procs: s.config.max_procs,
            live: s.num_procs.load(Ordering::Acquire),
            idle: self.capacity(),
            total_spawned: s.total_spawned.load(Ordering::Relaxed),
            total_recycled: s.total_recycled.load(Ordering::Relaxed),
        }
    }

    /// Rent a worker. Prefers an idle one; spawns lazily while under the
    /// cap; otherwise suspends until a checkin or a freed slot, bounded by
    /// `timeout` when set. The timed wait never consumes from the idle
    /// queue on expiry: cancellation can only land while parked on the
    /// notify, so an expired timer cannot have taken (and thereby lost) a
    /// worker.
    pub(crate) async fn checkout(&self, timeout: Option<Duration>) -> Result<Worker> {
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, self.acquire()).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::CheckoutTimeout),
            },
            None => self.acquire().await,
        }
    }

    /// One pass of the rent protocol, repeated until something gives: take
    /// an idle worker, else claim a slot and spawn, else park until a
    /// checkin or kill changes the picture.
    async fn acquire(&self) -> Result<Worker> {
        let s = &self.shared;
        loop {
            // Enabled before the checks below, so a notify landing between
            // a check and the park cannot be missed.
            let notified = s.idle_notify.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if s.stopping.load(Ordering::Acquire) {
                return Err(PoolError::PoolStopped);
            }
            if let Some(worker) = self.pop_idle_live() {
                return Ok(worker);
            }
            if self.reserve_slot() {
                match self.spawn_worker() {
                    Ok(worker) => return Ok(worker),
                    Err(e) => {
                        self.release_slot();
                        return Err(e);
                    }
                }
            }
            notified.await;
        }
    }

    /// Return a rented worker. Dead and over-limit workers are killed; a
    /// checkin during shutdown is a kill as well. Everything else goes to
    /// the tail of the idle queue.
    pub(crate) fn checkin(&self, worker: &Worker) {
        let s = &self.shared;
        if s.stopping.load(Ordering::Acquire) {
            self.kill(worker);
            return;
        }
        if worker.is_dead() {
            debug!(worker_id = worker.id(), "checkin of dead worker");
            self.kill(worker);
            return;
        }
        let max_reqs = s.config.max_reqs;
        if max_reqs > 0 && worker.messages_sent() >= max_reqs {
            debug!(
                worker_id = worker.id(),
                messages_sent = worker.messages_sent(),
                max_reqs,
                "recycling worker"
            );
            s.total_recycled.fetch_add(1, Ordering::Relaxed);
            self.kill(worker);
            return;
        }
        s.idle
            .lock()
            .expect("idle queue poisoned")
            .push_back(worker.clone());
        s.idle_notify.notify_waiters();
    }

    /// Shut a worker down and release its slot. Idempotent. The teardown
    /// itself (reaping the child, draining the reader) runs detached and is
    /// awaited by `shutdown`, so the bookkeeping here completes even when
    /// the calling future is dropped mid-await.
    pub(crate) fn kill(&self, worker: &Worker) {
        if worker.mark_killed() {
            return;
        }
        let s = &self.shared;
        let remaining = s.num_procs.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(worker_id = worker.id(), remaining, "killing worker");
        // A freed slot lets a parked taker spawn a replacement.
        s.idle_notify.notify_waiters();

        let doomed = worker.clone();
        let handle = tokio::spawn(async move {
            doomed.shutdown().await;
        });
        let mut teardowns = s.teardowns.lock().expect("teardown list poisoned");
        teardowns.retain(|h| !h.is_finished());
        teardowns.push(handle);
    }

    /// Drain the pool: refuse new checkouts, kill idle workers as they
    /// appear, and let `checkin` kill the checked-out ones as they return.
    /// Suspends until every worker slot is released and every child reaped.
    /// Afterwards the pool behaves as freshly constructed.
    pub(crate) async fn shutdown(&self) {
        let s = &self.shared;
        s.stopping.store(true, Ordering::Release);
        // Wake parked takers so they observe the stop and fail out.
        s.idle_notify.notify_waiters();
        info!(
            live = s.num_procs.load(Ordering::Acquire),
            idle = self.capacity(),
            "pool shutdown"
        );

        loop {
            if s.num_procs.load(Ordering::Acquire) == 0 {
                break;
            }
            let idle = s.idle.lock().expect("idle queue poisoned").pop_front();
            if let Some(worker) = idle {
                self.kill(&worker);
                continue;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let teardowns: Vec<JoinHandle<()>> = {
            let mut held = s.teardowns.lock().expect("teardown list poisoned");
            held.drain(..).collect()
        };
        for handle in teardowns {
            let _ = handle.await;
        }

        s.stopping.store(false, Ordering::Release);
        info!("pool shutdown complete");
    }

    /// Pop a live idle worker without suspending; corpses found in the
    /// queue are killed and skipped.
    fn pop_idle_live(&self) -> Option<Worker> {
        loop {
            let worker = self
                .shared
                .idle
                .lock()
                .expect("idle queue poisoned")
                .pop_front()?;
            if worker.is_dead() {
                debug!(worker_id = worker.id(), "discarding dead idle worker");
                self.kill(&worker);
                continue;
            }
            return Some(worker);
        }
    }

    /// Claim a worker slot under the cap. Lock-free so concurrent checkouts
    /// can never push `num_procs` past `max_procs`.
    fn reserve_slot(&self) -> bool {
        let s = &self.shared;
        let mut current = s.num_procs.load(Ordering::Acquire);
        loop {
            if current >= s.config.max_procs {
                return false;
            }
            match s.num_procs.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self) {
        self.shared.num_procs.fetch_sub(1, Ordering::AcqRel);
        self.shared.idle_notify.notify_waiters();
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let s = &self.shared;
        let id = s.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(id, &s.config.worker, Arc::clone(&s.config.codec))?;
        s.total_spawned.fetch_add(1, Ordering::Relaxed);
        Ok(worker)
    }
}
