//! Named operations executed across the process boundary.
//!
//! Executable code cannot travel through the wire protocol, so both sides
//! agree on names instead: runnables and callbacks are registered under
//! stable keys before the pool forks, the fork image inherits the
//! registries, and messages carry a key plus plain-data parameters.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::worker::Worker;
use crate::error::Result;

/// A unit of work executed inside a worker process.
///
/// The worker is the runnable's sole collaborator: implementations report
/// progress through [`Worker::log`], [`Worker::callback`] and
/// [`Worker::keepalive`].
pub trait Runnable: Send + Sync {
    /// Execute the work synchronously in the worker process.
    fn run(&self, worker: &mut Worker, params: &Value) -> Result<()>;
}

/// Closure adapter so plain functions register without a named struct.
pub struct RunnableFn<F> {
    f: F,
}

impl<F> RunnableFn<F>
where
    F: Fn(&mut Worker, &Value) -> Result<()> + Send + Sync + 'static,
{
    /// Wrap a closure as a [`Runnable`].
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Wrap a closure and return it as a shared handle.
    pub fn arc(f: F) -> Arc<dyn Runnable> {
        Arc::new(Self::new(f))
    }
}

impl<F> Runnable for RunnableFn<F>
where
    F: Fn(&mut Worker, &Value) -> Result<()> + Send + Sync + 'static,
{
    fn run(&self, worker: &mut Worker, params: &Value) -> Result<()> {
        (self.f)(worker, params)
    }
}

/// What travels on the wire instead of code: a registered name plus
/// plain-data parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    name: String,
    #[serde(default)]
    params: Value,
}

impl JobSpec {
    /// A job with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Value::Null,
        }
    }

    /// A job with parameters.
    pub fn with_params(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// The registered runnable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The plain-data parameters.
    pub fn params(&self) -> &Value {
        &self.params
    }
}

/// Runnables keyed by name, populated before the pool forks.
#[derive(Default)]
pub struct RunnableRegistry {
    entries: HashMap<String, Arc<dyn Runnable>>,
}

impl RunnableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runnable under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, runnable: Arc<dyn Runnable>) {
        self.entries.insert(name.into(), runnable);
    }

    /// Look up a runnable by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Runnable>> {
        self.entries.get(name).cloned()
    }

    /// Number of registered runnables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RunnableRegistry")
            .field("names", &names)
            .finish()
    }
}

/// A parent-side operation a worker may request by name.
pub type Callback = Box<dyn Fn(&[Value]) + Send + Sync>;

/// Callbacks keyed by name, invoked by the parent's notify handler.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: HashMap<String, Callback>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Box::new(callback));
    }

    /// Invoke the callback registered under `name`.
    ///
    /// Returns false when no such callback exists.
    pub fn invoke(&self, name: &str, parameters: &[Value]) -> bool {
        match self.entries.get(name) {
            Some(callback) => {
                callback(parameters);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("names", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_job_spec_defaults_params_to_null() {
        let parsed: JobSpec = serde_json::from_str(r#"{"name":"noop"}"#).unwrap();
        assert_eq!(parsed.name(), "noop");
        assert!(parsed.params().is_null());
    }

    #[test]
    fn test_job_spec_roundtrip() {
        let job = JobSpec::with_params("resize", json!({ "width": 640 }));
        let raw = serde_json::to_string(&job).unwrap();
        let parsed: JobSpec = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_runnable_registry_lookup() {
        let mut registry = RunnableRegistry::new();
        assert!(registry.is_empty());

        registry.register("noop", RunnableFn::arc(|_, _| Ok(())));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_runnable_fn_receives_params() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let seen_inner = Arc::clone(&seen);
        let runnable = RunnableFn::arc(move |_, params| {
            *seen_inner.lock().unwrap() = params.clone();
            Ok(())
        });

        let mut worker = Worker::stub(None, crate::pool::worker::WorkerStatus::Idle);
        runnable.run(&mut worker, &json!({ "depth": 2 })).unwrap();
        assert_eq!(seen.lock().unwrap()["depth"], 2);
    }

    #[test]
    fn test_callback_registry_invoke() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = Arc::clone(&calls);

        let mut registry = CallbackRegistry::new();
        registry.register("count", move |params| {
            assert_eq!(params.len(), 1);
            calls_inner.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.invoke("count", &[json!("x")]));
        assert!(!registry.invoke("missing", &[]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
