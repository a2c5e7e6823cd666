use crate::error::{TaskError, TaskErrorKind};
use crate::executor::{ExecutorHandle, TaskResult};
use crate::task::Task;
use std::collections::HashMap;
use std::sync::Arc;
use tabmon_adapter::error::AdapterError;
use tabmon_adapter::{build_adapter, canonical_name, BackendAdapter};

const DEFAULT_BACKENDS: [&str; 4] = ["sql", "wbem", "wmi", "wsman"];

/// Owns one executor per backend family. Every task for a backend goes
/// through the same executor, so a descriptor's connection is only ever
/// touched by one of them.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, ExecutorHandle>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an executor for every built-in backend. `limits` maps backend
    /// names (aliases accepted) to `max_parallel`; missing entries use 1.
    pub fn with_default_backends(limits: &HashMap<String, usize>) -> Result<Self, AdapterError> {
        let limits: HashMap<&str, usize> = limits
            .iter()
            .filter_map(|(name, limit)| match canonical_name(name) {
                Some(canonical) => Some((canonical, *limit)),
                None => {
                    tracing::warn!(backend = %name, "Ignoring parallelism limit for unknown backend");
                    None
                }
            })
            .collect();

        let mut registry = Self::new();
        for name in DEFAULT_BACKENDS {
            let max_parallel = limits.get(name).copied().unwrap_or(1);
            registry.register(build_adapter(name)?, max_parallel);
        }
        Ok(registry)
    }

    /// Starts an executor for `adapter`, replacing one registered under the
    /// same name.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>, max_parallel: usize) {
        let name = adapter.name().to_ascii_lowercase();
        tracing::info!(backend = %name, max_parallel, "Executor started");
        self.executors
            .insert(name, ExecutorHandle::spawn(adapter, max_parallel));
    }

    pub fn get(&self, backend: &str) -> Option<&ExecutorHandle> {
        let key = backend.trim().to_ascii_lowercase();
        self.executors.get(&key).or_else(|| {
            canonical_name(&key).and_then(|canonical| self.executors.get(canonical))
        })
    }

    /// Routes `task` to the executor of its backend.
    pub async fn submit(&self, task: Arc<Task>) -> TaskResult {
        match self.get(&task.backend) {
            Some(executor) => executor.submit(task).await,
            None => Err(TaskError::new(
                TaskErrorKind::Connect,
                format!("no executor for backend `{}`", task.backend),
            )),
        }
    }

    /// Drains and stops every executor, closing their connections.
    pub async fn shutdown(&self) {
        futures_util::future::join_all(self.executors.values().map(ExecutorHandle::shutdown)).await;
    }
}
