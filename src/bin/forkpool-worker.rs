//! Demo worker host for forkpool.
//!
//! Shows the embedding pattern: build a registry, call `init` first thing in
//! `main`. When the pool spawns this binary, `init` never returns and the
//! process serves tasks; run directly, it just prints the task list. The
//! integration tests point their pools at this binary.

use anyhow::Result;
use forkpool::TaskRegistry;
use serde_json::{Value, json};
use std::time::Duration;

/// The example task set.
fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register("noop", |_| Ok(Value::Null));

    registry.register("identity", |mut args| {
        args.pop().ok_or_else(|| "identity takes one argument".to_string())
    });

    registry.register("double", |args| {
        let n = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("double takes one integer")?;
        Ok(json!(n * 2))
    });

    // Returns a sequence, so `map` flattens it in place.
    registry.register("pair", |args| {
        let n = args
            .first()
            .and_then(Value::as_i64)
            .ok_or("pair takes one integer")?;
        Ok(json!([n, n + 1]))
    });

    registry.register("concat", |args| {
        let mut joined = String::new();
        for arg in &args {
            match arg.as_str() {
                Some(s) => joined.push_str(s),
                None => return Err("concat takes strings".to_string()),
            }
        }
        Ok(json!(joined))
    });

    registry.register("sleep_ms", |args| {
        let ms = args
            .first()
            .and_then(Value::as_u64)
            .ok_or("sleep_ms takes a duration in milliseconds")?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(json!(ms))
    });

    // Lets tests observe which child served a request.
    registry.register("pid", |_| Ok(json!(std::process::id())));

    registry.register("fail", |args| {
        let message = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("deliberate task failure");
        Err(message.to_string())
    });

    registry
}

fn main() -> Result<()> {
    forkpool::logging::init(forkpool::logging::LogConfig::new().with_env_overrides());

    let registry = build_registry();
    // Worker children never get past this line.
    forkpool::init(registry.clone());

    println!("forkpool demo worker; meant to be spawned by a ForkPool.");
    println!("registered tasks: {:?}", registry);
    Ok(())
}
