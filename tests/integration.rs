//! End-to-end tests against the demo worker binary.
//!
//! Every pool here points at the `forkpool-worker` fixture built alongside
//! the tests, so real child processes serve the tasks.

use forkpool::{ErrorFn, ForkPool, PoolConfig, PoolError, SuccessFn, WorkerCommand};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Pool configuration pointing at the fixture worker.
fn config() -> PoolConfig {
    PoolConfig::new().with_worker(WorkerCommand::new(env!("CARGO_BIN_EXE_forkpool-worker")))
}

fn pool(max_procs: usize, max_reqs: u64) -> ForkPool {
    ForkPool::with_config(
        config()
            .with_max_procs(max_procs)
            .with_max_reqs(max_reqs),
    )
    .expect("pool config is valid")
}

#[tokio::test]
async fn process_round_trips_a_value() {
    let pool = pool(2, 0);

    let answer = pool.process("double", vec![json!(21)]).await.unwrap();
    assert_eq!(answer, json!(42));

    // One lazy spawn, now idle again.
    let stats = pool.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(pool.capacity(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn process_is_identity_for_encodable_values() {
    let pool = pool(1, 0);

    for value in [
        json!(null),
        json!(true),
        json!(-17),
        json!(2.5),
        json!("text"),
        json!([1, [2, 3], {"k": "v"}]),
        json!({"nested": {"list": [null, false]}}),
    ] {
        let echoed = pool
            .process("identity", vec![value.clone()])
            .await
            .unwrap();
        assert_eq!(echoed, value);
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn map_returns_results_in_input_order() {
    let pool = pool(4, 0);

    let inputs: Vec<Value> = (1..=100).map(|n| json!(n)).collect();
    let results = pool.map("double", inputs).await.unwrap();

    let expected: Vec<Value> = (1..=100).map(|n| json!(n * 2)).collect();
    assert_eq!(results, expected);
    assert!(pool.stats().live <= 4);

    pool.shutdown().await;
}

#[tokio::test]
async fn map_flattens_sequence_results() {
    let pool = pool(2, 0);

    // `pair` returns [n, n + 1]; the elements land in place.
    let results = pool
        .map("pair", vec![json!(1), json!(10)])
        .await
        .unwrap();
    assert_eq!(results, vec![json!(1), json!(2), json!(10), json!(11)]);

    pool.shutdown().await;
}

#[tokio::test]
async fn recycling_rotates_child_processes() {
    let pool = pool(1, 3);

    let mut pids = HashSet::new();
    for _ in 0..10 {
        let pid = pool.process("pid", vec![]).await.unwrap();
        pids.insert(pid.as_u64().unwrap());
    }

    // 10 requests at 3 per worker: four distinct children.
    assert_eq!(pids.len(), 4);
    assert!(pool.stats().total_recycled >= 3);
    assert_eq!(pool.stats().live, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn checkout_timeout_fires_without_losing_the_worker() {
    let pool = pool(1, 0);

    // Occupy the only worker.
    let slow = pool.defer("sleep_ms", vec![json!(600)]).await.unwrap();

    let started = Instant::now();
    let err = pool
        .process_timeout("noop", vec![], Duration::from_millis(100))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, PoolError::CheckoutTimeout));
    assert!(waited >= Duration::from_millis(90));
    assert!(waited < Duration::from_millis(500));

    // The timeout consumed nothing: still one live worker, and the slow
    // task completes on it.
    assert_eq!(pool.stats().live, 1);
    assert_eq!(slow.wait().await.unwrap(), json!(600));

    // The worker is rentable again afterwards.
    assert_eq!(
        pool.process("double", vec![json!(5)]).await.unwrap(),
        json!(10)
    );

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deferred_tasks_run_in_parallel_up_to_the_cap() {
    let pool = pool(2, 0);

    // Four 300ms sleeps on two workers: two batches.
    let started = Instant::now();
    let mut deferred = Vec::new();
    for _ in 0..4 {
        deferred.push(pool.defer("sleep_ms", vec![json!(300)]).await.unwrap());
    }
    for handle in deferred {
        assert_eq!(handle.wait().await.unwrap(), json!(300));
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(550),
        "two workers cannot finish four 300ms tasks in {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(2500),
        "tasks did not run in parallel: {:?}",
        elapsed
    );
    assert_eq!(pool.stats().live, 2);

    pool.shutdown().await;
}

// Multi-thread flavor: the callback is observed through a blocking channel,
// which must not park the thread the collector task runs on.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_delivers_error_to_callback() {
    let pool = pool(1, 0);

    let (tx, rx) = std::sync::mpsc::channel::<String>();
    let success_tx = tx.clone();
    let on_success: SuccessFn = Box::new(move |value| {
        let _ = success_tx.send(format!("success: {}", value));
    });
    let on_error: ErrorFn = Box::new(move |error| {
        let _ = tx.send(format!("error: {}", error));
    });

    pool.queue(
        "fail",
        vec![json!("remote boom")],
        Some(on_success),
        Some(on_error),
    )
    .await
    .unwrap();

    let delivered = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(delivered.starts_with("error:"), "got {}", delivered);
    assert!(delivered.contains("remote boom"));
    // Only the error callback ran.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_delivers_value_to_callback() {
    let pool = pool(1, 0);

    let (tx, rx) = std::sync::mpsc::channel::<Value>();
    let on_success: SuccessFn = Box::new(move |value| {
        let _ = tx.send(value);
    });

    pool.queue("double", vec![json!(8)], Some(on_success), None)
        .await
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), json!(16));

    pool.shutdown().await;
}

#[tokio::test]
async fn remote_failure_is_reraised_in_process() {
    let pool = pool(1, 0);

    let err = pool.process("fail", vec![]).await.unwrap_err();
    match err {
        PoolError::Task(message) => assert!(message.contains("deliberate task failure")),
        other => panic!("expected Task error, got {:?}", other),
    }

    // The worker survives a failed task.
    assert_eq!(
        pool.process("double", vec![json!(1)]).await.unwrap(),
        json!(2)
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn unknown_task_name_is_a_task_error() {
    let pool = pool(1, 0);

    let err = pool.process("no_such_task", vec![]).await.unwrap_err();
    match err {
        PoolError::Task(message) => assert!(message.contains("unknown task")),
        other => panic!("expected Task error, got {:?}", other),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn defer_then_shutdown_does_not_hang() {
    let pool = pool(1, 0);

    let deferred = pool.defer("double", vec![json!(3)]).await.unwrap();
    pool.shutdown().await;

    // Either the response beat the shutdown or the worker died first; both
    // are acceptable, hanging is not.
    let outcome = tokio::time::timeout(Duration::from_secs(10), deferred.wait())
        .await
        .expect("deferred outcome must resolve");
    match outcome {
        Ok(value) => assert_eq!(value, json!(6)),
        Err(PoolError::WorkerDead) => {}
        Err(other) => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(pool.stats().live, 0);
    assert_eq!(pool.capacity(), 0);
}

#[tokio::test]
async fn pool_is_reusable_after_shutdown() {
    let pool = pool(2, 0);

    assert_eq!(
        pool.process("double", vec![json!(2)]).await.unwrap(),
        json!(4)
    );
    pool.shutdown().await;
    assert_eq!(pool.stats().live, 0);

    // Behaves as freshly constructed.
    assert_eq!(
        pool.process("double", vec![json!(4)]).await.unwrap(),
        json!(8)
    );
    assert_eq!(pool.stats().live, 1);

    pool.shutdown().await;
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn worker_that_exits_immediately_surfaces_worker_dead() {
    let pool = ForkPool::with_config(
        PoolConfig::new()
            .with_max_procs(1)
            .with_worker(WorkerCommand::new("/bin/true")),
    )
    .unwrap();

    let err = pool.process("double", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerDead), "got {:?}", err);

    pool.shutdown().await;
}

#[tokio::test]
async fn sequential_submissions_reuse_the_worker() {
    let pool = pool(1, 0);

    // Sequential submissions reuse the same child.
    let first = pool.process("pid", vec![]).await.unwrap();
    let second = pool.process("pid", vec![]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(pool.stats().total_spawned, 1);

    pool.shutdown().await;
}
