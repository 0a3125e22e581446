//! Execution substrates.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::graph::TaskUnit;
use super::types::{Priority, QueueName, TaskRetryPolicy};
use crate::{Error, Result};

/// Opaque reference to a submitted unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// The narrow interface consumed from a task queue.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    /// Submit `unit`; it must not start before every handle in `dependencies`
    /// has succeeded.
    async fn submit(
        &self,
        unit: &TaskUnit,
        priority: Priority,
        queue: QueueName,
        retry: &TaskRetryPolicy,
        dependencies: &[TaskHandle],
    ) -> Result<TaskHandle>;

    async fn cancel(&self, handle: &TaskHandle) -> Result<()>;

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus>;

    /// Drop local bookkeeping for a finished unit. Returns false when the
    /// unit is unknown or still live.
    async fn release(&self, _handle: &TaskHandle) -> Result<bool> {
        Ok(false)
    }
}

/// Runs one unit for the local substrate.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, unit: &TaskUnit, cancel: &CancellationToken) -> Result<()>;
}

struct LocalTask {
    status: watch::Receiver<TaskStatus>,
    cancel: CancellationToken,
    priority: Priority,
    queue: QueueName,
}

/// In-process substrate backed by tokio tasks.
///
/// Units start once their dependencies succeed; a failed or cancelled
/// dependency cancels the dependents. Finished units stay queryable until
/// they are [released](ExecutionSubstrate::release).
pub struct LocalSubstrate {
    executor: Arc<dyn UnitExecutor>,
    tasks: Arc<DashMap<String, LocalTask>>,
}

impl LocalSubstrate {
    pub fn new(executor: Arc<dyn UnitExecutor>) -> Self {
        Self {
            executor,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Priority and queue a handle was submitted with.
    pub fn placement(&self, handle: &TaskHandle) -> Option<(Priority, QueueName)> {
        self.tasks.get(&handle.0).map(|t| (t.priority, t.queue))
    }

    /// Wait until `handle` reaches a terminal state.
    pub async fn wait(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        let mut rx = self
            .tasks
            .get(&handle.0)
            .map(|t| t.status.clone())
            .ok_or_else(|| Error::validation(format!("unknown task '{}'", handle)))?;
        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(TaskStatus::Cancelled);
        Ok(status)
    }
}

async fn wait_terminal(mut rx: watch::Receiver<TaskStatus>) -> TaskStatus {
    match rx.wait_for(|s| s.is_terminal()).await {
        Ok(s) => *s,
        Err(_) => TaskStatus::Cancelled,
    }
}

#[async_trait]
impl ExecutionSubstrate for LocalSubstrate {
    async fn submit(
        &self,
        unit: &TaskUnit,
        priority: Priority,
        queue: QueueName,
        retry: &TaskRetryPolicy,
        dependencies: &[TaskHandle],
    ) -> Result<TaskHandle> {
        let mut deps = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let rx = self
                .tasks
                .get(&dep.0)
                .map(|t| t.status.clone())
                .ok_or_else(|| Error::validation(format!("unknown dependency '{}'", dep)))?;
            deps.push(rx);
        }

        let handle = TaskHandle(format!("{}:{}", unit.run_id, unit.id));
        let (tx, rx) = watch::channel(TaskStatus::Queued);
        let cancel = CancellationToken::new();
        self.tasks.insert(
            handle.0.clone(),
            LocalTask {
                status: rx,
                cancel: cancel.clone(),
                priority,
                queue,
            },
        );

        let executor = self.executor.clone();
        let unit = unit.clone();
        let retry = retry.clone();
        tokio::spawn(async move {
            for dep in deps {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => TaskStatus::Cancelled,
                    s = wait_terminal(dep) => s,
                };
                if outcome != TaskStatus::Succeeded {
                    debug!(unit = %unit.id, "Dependency did not succeed, cancelling unit");
                    let _ = tx.send(TaskStatus::Cancelled);
                    return;
                }
            }

            let mut attempt = 0;
            loop {
                let _ = tx.send(TaskStatus::Running);
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    r = executor.execute(&unit, &cancel) => r,
                };
                match result {
                    Ok(()) => {
                        let _ = tx.send(TaskStatus::Succeeded);
                        return;
                    }
                    Err(e) if e.is_cancelled() => {
                        let _ = tx.send(TaskStatus::Cancelled);
                        return;
                    }
                    Err(e) if attempt < retry.max_retries => {
                        let delay = retry.delay_for(attempt);
                        warn!(unit = %unit.id, attempt, delay_secs = delay.as_secs(), error = %e, "Unit failed, retrying");
                        let _ = tx.send(TaskStatus::Retrying);
                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = tx.send(TaskStatus::Cancelled);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        warn!(unit = %unit.id, error = %e, "Unit failed");
                        let _ = tx.send(TaskStatus::Failed);
                        return;
                    }
                }
            }
        });

        info!(handle = %handle, priority = priority.value(), queue = %queue, "Submitted unit");
        Ok(handle)
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let task = self
            .tasks
            .get(&handle.0)
            .ok_or_else(|| Error::validation(format!("unknown task '{}'", handle)))?;
        task.cancel.cancel();
        Ok(())
    }

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        self.tasks
            .get(&handle.0)
            .map(|t| *t.status.borrow())
            .ok_or_else(|| Error::validation(format!("unknown task '{}'", handle)))
    }

    async fn release(&self, handle: &TaskHandle) -> Result<bool> {
        let removed = self
            .tasks
            .remove_if(&handle.0, |_, task| task.status.borrow().is_terminal())
            .is_some();
        if removed {
            debug!(handle = %handle, "Released finished unit");
        }
        Ok(removed)
    }
}
