//! Lifecycle of detached consumer tasks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::cancellation::CancellationFlag;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks spawned tasks so they can be stopped together.
///
/// Every task receives a child of the manager's flag: it observes process
/// signals and the manager's own shutdown, and raising it from inside a task
/// stops nothing else.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    flag: CancellationFlag,
}

impl TaskManager {
    pub fn new(parent: &CancellationFlag) -> Self {
        Self {
            tasks: HashMap::new(),
            flag: parent.child(),
        }
    }

    /// Spawns and registers a task with the given name.
    pub fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F)
    where
        F: FnOnce(CancellationFlag) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task_flag = self.flag.child();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {}", task_name);
            match task_fn(task_flag).await {
                Ok(()) => {
                    info!("Task '{}' completed successfully", task_name);
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{}' failed: {}", task_name, e);
                    Err(e)
                }
            }
        });

        if let Some(previous) = self.tasks.insert(name.clone(), handle) {
            warn!("Task '{}' replaced; aborting the previous instance", name);
            previous.abort();
        }
        info!("Task '{}' spawned", name);
    }

    /// Cancels every task and waits for each one, up to [`SHUTDOWN_TIMEOUT`].
    ///
    /// Returns the first error encountered, if any.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.flag.raise();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Task '{}' failed during shutdown: {}", name, e);
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    let error = anyhow::anyhow!("Task '{}' panicked: {}", name, e);
                    error!("{}", error);
                    first_error.get_or_insert(error);
                }
                Err(_) => {
                    let error = anyhow::anyhow!("Task '{}' shutdown timeout exceeded", name);
                    error!("{}", error);
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            Err(error).context("One or more tasks failed during shutdown")
        } else {
            info!("All tasks stopped");
            Ok(())
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}
