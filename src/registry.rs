//! Named task functions resolved on the worker side.
//!
//! The parent serializes a task *name*; the worker looks the name up here
//! and runs the matching function. Both processes run the same executable,
//! so registering tasks before [`crate::init`] makes the same table
//! available on both sides.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered task function. Runs on the worker's blocking thread pool, so
/// it may compute or sleep freely. Errors are reported back to the submitter
/// as remote task failures.
pub type TaskFn =
    Arc<dyn Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static>;

/// Runner for opaque serialized callables, for embedders whose codec can
/// reconstruct them. Without one installed, callable targets are rejected
/// with a remote error.
pub type CallableFn =
    Arc<dyn Fn(Vec<u8>, Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static>;

/// Table of tasks a worker can run.
///
/// Closures over the parent's environment do not survive the trip through
/// the pipe; register the work under a name instead and pass only the
/// arguments. This also shifts setup cost (imports, caches) into the worker,
/// where it is paid once per process rather than once per task.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
    callable_runner: Option<CallableFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under a name. Replaces any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(f));
        self
    }

    /// Install a runner for [`crate::TaskTarget::Callable`] targets.
    pub fn set_callable_runner<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>, Vec<Value>) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.callable_runner = Some(Arc::new(f));
        self
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub(crate) fn callable_runner(&self) -> Option<CallableFn> {
        self.callable_runner.clone()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry")
            .field("tasks", &names)
            .field("callable_runner", &self.callable_runner.is_some())
            .finish()
    }
}
