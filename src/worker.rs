//! Parent-side handle to one worker subprocess.
//!
//! A `Worker` owns a child process and its pipe pair and multiplexes
//! in-flight requests by message id: `send` writes one frame and returns
//! the id, `recv` suspends on a single-shot result slot until the worker's
//! reader task delivers the matching response. The slot table is what keeps
//! send and receive decoupled: a response that lands before its collector
//! reaches `recv` is parked in the table rather than lost, and several
//! collectors may be parked on one worker at once.

use crate::codec::Codec;
use crate::error::{PoolError, Result};
use crate::ipc::{FrameReader, FrameWriter};
use crate::pool::WorkerCommand;
use crate::protocol::{Request, ResponseStatus, TaskTarget};
use crate::worker_main::WORKER_ENV;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How long a worker gets to exit after its stdin closes, before SIGTERM.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// How long a worker gets after SIGTERM, before SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Process-wide message id allocator. Ids are handed out under the outbound
/// sink lock, so per-worker id order matches frame order.
static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of one task as observed by the reader task.
type TaskOutcome = std::result::Result<Value, PoolError>;

/// One entry in the result-slot table.
enum Slot {
    /// A submitter is parked in `recv` waiting for the response.
    Waiting(oneshot::Sender<TaskOutcome>),
    /// The response arrived before the submitter; held until collected.
    Arrived(TaskOutcome),
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<u64, Slot>,
    /// Set once the reader task stops; `recv` on an unknown id fails fast.
    dead: bool,
}

/// Handle to a worker subprocess. Cheap to clone; all clones share the same
/// child process and slot table.
#[derive(Clone)]
pub(crate) struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    /// Pool-assigned id, for logging.
    id: usize,
    pid: u32,
    codec: Arc<dyn Codec>,
    /// Outbound frame sink. `None` once closed; writes are serialized by the
    /// lock, one frame at a time.
    writer: tokio::sync::Mutex<Option<FrameWriter<ChildStdin>>>,
    /// Child handle, taken at shutdown for reaping.
    child: tokio::sync::Mutex<Option<Child>>,
    slots: Arc<Mutex<SlotTable>>,
    messages_sent: AtomicU64,
    /// Pool-kill once flag; makes `Pool::kill` idempotent.
    killed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a worker subprocess and start its reader task.
    ///
    /// The worker runs the configured executable (by default the parent's
    /// own) with the worker marker in its environment; `forkpool::init` in
    /// the child's `main` diverts it into the worker loop.
    pub(crate) fn spawn(id: usize, command: &WorkerCommand, codec: Arc<dyn Codec>) -> Result<Self> {
        let program = command.resolve_program()?;

        let mut cmd = Command::new(&program);
        cmd.args(command.args());
        for (key, value) in command.envs() {
            cmd.env(key, value);
        }
        cmd.env(WORKER_ENV, "1");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped()); // forwarded into tracing
        // Backstop for handles dropped without an orderly shutdown.
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", program.display(), e)))?;
        let pid = child.id().unwrap_or_default();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("worker stdout not captured".into()))?;
        let stderr = child.stderr.take();

        let slots: Arc<Mutex<SlotTable>> = Arc::default();
        let reader = tokio::spawn(reader_loop(
            id,
            FrameReader::new(stdout),
            Arc::clone(&slots),
            Arc::clone(&codec),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(id, stderr));
        }

        debug!(worker_id = id, pid, "spawned worker");

        Ok(Self {
            inner: Arc::new(WorkerInner {
                id,
                pid,
                codec,
                writer: tokio::sync::Mutex::new(Some(FrameWriter::new(stdin))),
                child: tokio::sync::Mutex::new(Some(child)),
                slots,
                messages_sent: AtomicU64::new(0),
                killed: AtomicBool::new(false),
                reader: Mutex::new(Some(reader)),
            }),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    /// Total accepted sends on this worker. Never decreases.
    pub(crate) fn messages_sent(&self) -> u64 {
        self.inner.messages_sent.load(Ordering::Relaxed)
    }

    /// Whether the reader task has observed the worker's death.
    pub(crate) fn is_dead(&self) -> bool {
        self.inner.slots.lock().expect("slot table poisoned").dead
    }

    /// First pool-kill wins; later calls are no-ops.
    pub(crate) fn mark_killed(&self) -> bool {
        self.inner.killed.swap(true, Ordering::AcqRel)
    }

    /// Queue one task outbound. Allocates the message id, writes the frame,
    /// and bumps `messages_sent`. Fails with `WorkerDead` once the outbound
    /// sink is closed or broken.
    pub(crate) async fn send(&self, target: &TaskTarget, args: &[Value]) -> Result<u64> {
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(PoolError::WorkerDead)?;

        let msgid = NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id: msgid,
            target: target.clone(),
            args: args.to_vec(),
        };
        let payload = self.inner.codec.encode_request(&request)?;

        if let Err(e) = sink.write_frame(&payload).await {
            warn!(
                worker_id = self.inner.id,
                msgid,
                error = %e,
                "failed to write request frame"
            );
            // A broken sink never recovers; close it so later sends fail fast.
            *writer = None;
            return Err(PoolError::WorkerDead);
        }

        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        trace!(worker_id = self.inner.id, msgid, target = %target, "sent task");
        Ok(msgid)
    }

    /// Suspend until the response for `msgid` arrives, then return its value
    /// or re-raise the remote failure. Fails with `WorkerDead` if the worker
    /// exits first.
    pub(crate) async fn recv(&self, msgid: u64) -> Result<Value> {
        let rx = {
            let mut table = self.inner.slots.lock().expect("slot table poisoned");
            match table.slots.remove(&msgid) {
                // Response beat us here.
                Some(Slot::Arrived(outcome)) => return outcome,
                Some(Slot::Waiting(_)) => {
                    // Two receivers for one id; the first sender is gone now,
                    // so the only honest answer is an invariant failure.
                    return Err(PoolError::UnknownMsgId(msgid));
                }
                None => {
                    if table.dead {
                        return Err(PoolError::WorkerDead);
                    }
                    let (tx, rx) = oneshot::channel();
                    table.slots.insert(msgid, Slot::Waiting(tx));
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(PoolError::WorkerDead))
    }

    /// Tear the worker down: close the outbound sink (EOF is the worker's
    /// exit signal), escalate to SIGTERM then SIGKILL if it lingers, reap
    /// the child, await the reader task, and fail any still-parked `recv`
    /// callers with `WorkerDead`.
    pub(crate) async fn shutdown(&self) {
        self.inner.writer.lock().await.take();

        if let Some(mut child) = self.inner.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    trace!(worker_id = self.inner.id, %status, "worker exited");
                }
                Ok(Err(e)) => {
                    warn!(worker_id = self.inner.id, error = %e, "failed to reap worker");
                }
                Err(_) => {
                    debug!(
                        worker_id = self.inner.id,
                        pid = self.inner.pid,
                        "worker did not exit on stdin close, sending SIGTERM"
                    );
                    let _ = signal::kill(Pid::from_raw(self.inner.pid as i32), Signal::SIGTERM);
                    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                        warn!(
                            worker_id = self.inner.id,
                            pid = self.inner.pid,
                            "worker ignored SIGTERM, killing"
                        );
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
        }

        let reader = self
            .inner
            .reader
            .lock()
            .expect("reader handle poisoned")
            .take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        fail_outstanding(&self.inner.slots, self.inner.id);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("messages_sent", &self.messages_sent())
            .finish()
    }
}

/// Long-lived task draining the worker's stdout: decode each inbound frame
/// and deliver it to the matching result slot, creating the slot when the
/// response arrives before the submitter. On EOF or a decode failure, mark
/// the worker dead and fail everything outstanding.
async fn reader_loop(
    worker_id: usize,
    mut frames: FrameReader<ChildStdout>,
    slots: Arc<Mutex<SlotTable>>,
    codec: Arc<dyn Codec>,
) {
    loop {
        match frames.read_frame().await {
            Ok(Some(payload)) => {
                let response = match codec.decode_response(&payload) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(worker_id, error = %e, "undecodable response frame");
                        break;
                    }
                };
                let msgid = response.id;
                let outcome = match response.status {
                    ResponseStatus::Ok => Ok(response.body),
                    ResponseStatus::Err => Err(PoolError::Task(response.error_message())),
                };
                trace!(worker_id, msgid, "response received");
                deliver(&slots, worker_id, msgid, outcome);
            }
            Ok(None) => {
                debug!(worker_id, "worker closed its stdout");
                break;
            }
            Err(e) => {
                warn!(worker_id, error = %e, "failed to read response frame");
                break;
            }
        }
    }
    fail_outstanding(&slots, worker_id);
}

fn deliver(slots: &Mutex<SlotTable>, worker_id: usize, msgid: u64, outcome: TaskOutcome) {
    let mut table = slots.lock().expect("slot table poisoned");
    match table.slots.remove(&msgid) {
        Some(Slot::Waiting(tx)) => {
            // Receiver may have been dropped (cancelled submitter); the
            // outcome is then discarded, which matches a dropped future.
            let _ = tx.send(outcome);
        }
        Some(arrived @ Slot::Arrived(_)) => {
            warn!(worker_id, msgid, "duplicate response for message id");
            table.slots.insert(msgid, arrived);
        }
        None => {
            table.slots.insert(msgid, Slot::Arrived(outcome));
        }
    }
}

/// Mark the worker dead and fail every parked `recv`. Responses that already
/// arrived stay collectable, so a result that raced shutdown is not lost.
fn fail_outstanding(slots: &Mutex<SlotTable>, worker_id: usize) {
    let mut table = slots.lock().expect("slot table poisoned");
    table.dead = true;

    let waiting: Vec<u64> = table
        .slots
        .iter()
        .filter(|(_, slot)| matches!(slot, Slot::Waiting(_)))
        .map(|(id, _)| *id)
        .collect();
    if waiting.is_empty() {
        return;
    }
    debug!(
        worker_id,
        failed = waiting.len(),
        "failing outstanding result slots"
    );
    for msgid in waiting {
        if let Some(Slot::Waiting(tx)) = table.slots.remove(&msgid) {
            let _ = tx.send(Err(PoolError::WorkerDead));
        }
    }
}

/// Forward worker stderr into tracing, categorized by content.
async fn forward_stderr(worker_id: usize, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.starts_with("trace") {
            trace!(worker_id, "{}", line);
        } else if lower.contains("error") {
            warn!(worker_id, "{}", line);
        } else {
            debug!(worker_id, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recv_after_delivery() {
        let slots: Arc<Mutex<SlotTable>> = Arc::default();
        deliver(&slots, 0, 5, Ok(json!(10)));

        // The Arrived slot is held until collected.
        let table = slots.lock().unwrap();
        assert!(matches!(table.slots.get(&5), Some(Slot::Arrived(_))));
    }

    #[tokio::test]
    async fn test_deliver_wakes_waiting_slot() {
        let slots: Arc<Mutex<SlotTable>> = Arc::default();
        let (tx, rx) = oneshot::channel();
        slots.lock().unwrap().slots.insert(9, Slot::Waiting(tx));

        deliver(&slots, 0, 9, Ok(json!("done")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("done"));
        assert!(slots.lock().unwrap().slots.is_empty());
    }

    #[tokio::test]
    async fn test_fail_outstanding_spares_arrived() {
        let slots: Arc<Mutex<SlotTable>> = Arc::default();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = slots.lock().unwrap();
            table.slots.insert(1, Slot::Waiting(tx));
            table.slots.insert(2, Slot::Arrived(Ok(json!(6))));
        }

        fail_outstanding(&slots, 0);

        // The parked receiver fails, the arrived result survives.
        assert!(matches!(rx.await.unwrap(), Err(PoolError::WorkerDead)));
        let table = slots.lock().unwrap();
        assert!(table.dead);
        assert!(matches!(table.slots.get(&2), Some(Slot::Arrived(Ok(_)))));
    }
}
