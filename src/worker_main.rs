//! Worker subprocess entry point.
//!
//! Host binaries call [`init`] first thing in `main`. In the parent it is a
//! no-op; in a child spawned by the pool (detected via the environment
//! marker) it never returns: the process becomes a worker that reads task
//! frames from stdin until EOF, runs each against the registry, and writes
//! exactly one response frame per request to stdout.
//!
//! Requests are processed one at a time, in arrival order. The parent may
//! pipeline several requests into a worker; they queue in the pipe and the
//! responses come back in the same order. Parallelism comes from the pool
//! running many workers, not from concurrency inside one.

use crate::codec::{Codec, JsonCodec};
use crate::ipc::{FrameReader, FrameWriter};
use crate::protocol::{Request, Response, TaskTarget};
use crate::registry::TaskRegistry;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Environment marker the pool sets on spawned workers. Presence of this
/// variable is what diverts [`init`] into the worker loop.
pub const WORKER_ENV: &str = "FORKPOOL_WORKER";

/// Divert this process into the worker loop if it was spawned as a worker.
///
/// Call before anything else in `main`; in the parent process this returns
/// immediately. Tasks must be registered before this point so the same
/// table exists on both sides of the pipe.
pub fn init(registry: TaskRegistry) {
    init_with_codec(registry, Arc::new(JsonCodec));
}

/// As [`init`], with a custom codec. Must match the codec configured on the
/// parent's pool.
pub fn init_with_codec(registry: TaskRegistry, codec: Arc<dyn Codec>) {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    run_worker(registry, codec);
}

/// Run the worker to completion and exit the process.
fn run_worker(registry: TaskRegistry, codec: Arc<dyn Codec>) -> ! {
    // Pipe errors arrive as io::Error from the frame layer; a SIGPIPE
    // default would kill the process before that.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("worker runtime setup failed: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let reader = FrameReader::new(tokio::io::stdin());
        let writer = FrameWriter::new(tokio::io::stdout());
        match worker_loop(reader, writer, Arc::new(registry), codec).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("worker error: {}", e);
                1
            }
        }
    });
    std::process::exit(code)
}

/// Read requests until EOF; one response frame per request.
///
/// An undecodable request means the two ends disagree about the protocol;
/// there is no id to answer with, so the worker exits and lets the parent
/// observe the EOF.
pub(crate) async fn worker_loop<R, W>(
    mut reader: FrameReader<R>,
    mut writer: FrameWriter<W>,
    registry: Arc<TaskRegistry>,
    codec: Arc<dyn Codec>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = reader.read_frame().await? {
        let request = match codec.decode_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("undecodable request frame: {}", e),
                ));
            }
        };

        let response = run_request(&registry, request).await;
        let bytes = codec
            .encode_response(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        writer.write_frame(&bytes).await?;
    }
    Ok(())
}

/// Run one task to a response. Task panics and registry misses become `Err`
/// responses rather than killing the worker.
async fn run_request(registry: &Arc<TaskRegistry>, request: Request) -> Response {
    let Request { id, target, args } = request;

    match target {
        TaskTarget::Named(name) => match registry.get(&name) {
            Some(task) => {
                // Tasks are plain blocking functions; keep the runtime free
                // to service the pipes while one runs.
                let result = tokio::task::spawn_blocking(move || task(args)).await;
                match result {
                    Ok(Ok(value)) => Response::ok(id, value),
                    Ok(Err(message)) => Response::err(id, message),
                    Err(join_error) => Response::err(id, format!("task panicked: {}", join_error)),
                }
            }
            None => Response::err(id, format!("unknown task '{}'", name)),
        },
        TaskTarget::Callable(bytes) => match registry.callable_runner() {
            Some(runner) => {
                let result = tokio::task::spawn_blocking(move || runner(bytes, args)).await;
                match result {
                    Ok(Ok(value)) => Response::ok(id, value),
                    Ok(Err(message)) => Response::err(id, message),
                    Err(join_error) => Response::err(id, format!("task panicked: {}", join_error)),
                }
            }
            None => Response::err(
                id,
                "serialized callables are not supported by this worker; \
                 register the task under a name instead",
            ),
        },
    }
}
