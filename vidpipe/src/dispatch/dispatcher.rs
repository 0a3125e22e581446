use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::graph::TaskGraph;
use super::substrate::{ExecutionSubstrate, TaskHandle, TaskStatus};
use super::types::{Priority, TaskRetryPolicy};
use crate::pipeline::PipelineRequest;
use crate::{Error, Result};

/// Handles of one dispatched run, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedRun {
    pub run_id: String,
    pub handles: Vec<(String, TaskHandle)>,
}

impl DispatchedRun {
    pub fn handle(&self, unit_id: &str) -> Option<&TaskHandle> {
        self.handles
            .iter()
            .find(|(id, _)| id == unit_id)
            .map(|(_, h)| h)
    }
}

/// Submits run graphs to an [`ExecutionSubstrate`].
pub struct Dispatcher {
    substrate: Arc<dyn ExecutionSubstrate>,
    retry: TaskRetryPolicy,
    runs: DashMap<String, DispatchedRun>,
}

impl Dispatcher {
    pub fn new(substrate: Arc<dyn ExecutionSubstrate>) -> Self {
        Self {
            substrate,
            retry: TaskRetryPolicy::default(),
            runs: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: TaskRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate `request`, build its graph and submit every unit in
    /// dependency order.
    pub async fn dispatch(
        &self,
        run_id: &str,
        request: &PipelineRequest,
        priority: Priority,
    ) -> Result<DispatchedRun> {
        request.validate()?;
        let graph = TaskGraph::for_run(run_id, request, priority);
        self.dispatch_graph(run_id, &graph).await
    }

    /// Submit an arbitrary graph. On a submit error, already submitted units
    /// are cancelled.
    pub async fn dispatch_graph(&self, run_id: &str, graph: &TaskGraph) -> Result<DispatchedRun> {
        let order = graph.topological_order()?;
        let mut submitted: HashMap<&str, TaskHandle> = HashMap::with_capacity(order.len());
        let mut handles = Vec::with_capacity(order.len());

        for unit in order {
            let deps: Vec<TaskHandle> = unit
                .depends_on
                .iter()
                .filter_map(|d| submitted.get(d.as_str()).cloned())
                .collect();
            let result = self
                .substrate
                .submit(unit, unit.priority, unit.queue, &self.retry, &deps)
                .await;
            match result {
                Ok(handle) => {
                    submitted.insert(unit.id.as_str(), handle.clone());
                    handles.push((unit.id.clone(), handle));
                }
                Err(e) => {
                    warn!(run_id, unit = %unit.id, error = %e, "Submit failed, rolling back run");
                    for (_, handle) in &handles {
                        let _ = self.substrate.cancel(handle).await;
                    }
                    return Err(e);
                }
            }
        }

        let dispatched = DispatchedRun {
            run_id: run_id.to_string(),
            handles,
        };
        info!(run_id, units = dispatched.handles.len(), "Run dispatched");
        self.runs.insert(run_id.to_string(), dispatched.clone());
        Ok(dispatched)
    }

    /// Cancel every unit of a run. Returns how many cancels were accepted.
    pub async fn cancel_run(&self, run_id: &str) -> Result<usize> {
        let handles = self
            .runs
            .get(run_id)
            .map(|r| r.handles.clone())
            .ok_or_else(|| Error::validation(format!("run '{}' was not dispatched", run_id)))?;
        let mut cancelled = 0;
        for (unit, handle) in &handles {
            match self.substrate.cancel(handle).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(run_id, unit = %unit, error = %e, "Cancel failed"),
            }
        }
        info!(run_id, cancelled, "Run cancelled");
        Ok(cancelled)
    }

    /// Forget a finished run here and in the substrate.
    ///
    /// Fails while any unit of the run is still queued or running.
    pub async fn forget_run(&self, run_id: &str) -> Result<usize> {
        let statuses = self.run_status(run_id).await?;
        if let Some((unit, status)) = statuses.iter().find(|(_, s)| !s.is_terminal()) {
            return Err(Error::validation(format!(
                "run '{}' is still active: unit '{}' is {}",
                run_id, unit, status
            )));
        }
        let Some((_, run)) = self.runs.remove(run_id) else {
            return Ok(0);
        };
        let mut released = 0;
        for (_, handle) in &run.handles {
            if self.substrate.release(handle).await? {
                released += 1;
            }
        }
        info!(run_id, released, "Run forgotten");
        Ok(released)
    }

    /// Status of every unit of a run, in submission order.
    pub async fn run_status(&self, run_id: &str) -> Result<Vec<(String, TaskStatus)>> {
        let handles = self
            .runs
            .get(run_id)
            .map(|r| r.handles.clone())
            .ok_or_else(|| Error::validation(format!("run '{}' was not dispatched", run_id)))?;
        let mut statuses = Vec::with_capacity(handles.len());
        for (unit, handle) in handles {
            statuses.push((unit, self.substrate.status(&handle).await?));
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::dispatch::graph::{TaskUnit, UnitKind};
    use crate::dispatch::substrate::{LocalSubstrate, UnitExecutor};
    use crate::dispatch::types::QueueName;

    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
        block_process: bool,
    }

    #[async_trait]
    impl UnitExecutor for Recorder {
        async fn execute(&self, unit: &TaskUnit, cancel: &CancellationToken) -> Result<()> {
            if matches!(unit.kind, UnitKind::Process) && self.block_process {
                cancel.cancelled().await;
                return Err(Error::Cancelled);
            }
            if matches!(unit.kind, UnitKind::Aggregate)
                && self.fail_first.load(Ordering::SeqCst) > 0
            {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Other("transient".to_string()));
            }
            self.order.lock().push(unit.id.clone());
            Ok(())
        }
    }

    fn request() -> PipelineRequest {
        PipelineRequest {
            urls: vec!["https://a/1.mp4".into(), "https://a/2.mp4".into()],
            merge_episodes: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_units_run_after_dependencies() {
        let recorder = Arc::new(Recorder {
            fail_first: AtomicUsize::new(1),
            ..Default::default()
        });
        let substrate = Arc::new(LocalSubstrate::new(recorder.clone()));
        let dispatcher = Dispatcher::new(substrate.clone()).with_retry(TaskRetryPolicy::none());

        let run = dispatcher
            .dispatch("run-1", &request(), Priority::High)
            .await
            .unwrap();
        assert_eq!(run.handles.len(), 6);

        let notify = run.handle("notify").unwrap();
        // The aggregation unit fails once without retries, so the tail is cancelled.
        assert_eq!(substrate.wait(notify).await.unwrap(), TaskStatus::Cancelled);
        let statuses = dispatcher.run_status("run-1").await.unwrap();
        assert_eq!(statuses[2], ("aggregate".to_string(), TaskStatus::Failed));

        let retrying = Dispatcher::new(substrate.clone()).with_retry(TaskRetryPolicy {
            max_retries: 1,
            interval_start_secs: 0,
            interval_step_secs: 0,
            interval_max_secs: 0,
        });
        recorder.fail_first.store(1, Ordering::SeqCst);
        recorder.order.lock().clear();
        let run = retrying
            .dispatch("run-2", &request(), Priority::High)
            .await
            .unwrap();
        let notify = run.handle("notify").unwrap();
        assert_eq!(substrate.wait(notify).await.unwrap(), TaskStatus::Succeeded);

        let order = recorder.order.lock().clone();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("download_0") < pos("aggregate"));
        assert!(pos("download_1") < pos("aggregate"));
        assert!(pos("aggregate") < pos("process"));
        assert!(pos("process") < pos("merge"));
        assert!(pos("merge") < pos("notify"));

        let merge = run.handle("merge").unwrap();
        assert_eq!(
            substrate.placement(merge),
            Some((Priority::High, QueueName::Merge))
        );
        assert_eq!(
            substrate.placement(notify),
            Some((Priority::Normal, QueueName::Notifications))
        );
    }

    #[tokio::test]
    async fn test_forget_run_releases_finished_units() {
        let recorder = Arc::new(Recorder {
            block_process: true,
            ..Default::default()
        });
        let substrate = Arc::new(LocalSubstrate::new(recorder));
        let dispatcher = Dispatcher::new(substrate.clone()).with_retry(TaskRetryPolicy::none());

        let run = dispatcher
            .dispatch("run-4", &request(), Priority::Normal)
            .await
            .unwrap();
        let process = run.handle("process").unwrap().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while substrate.status(&process).await.unwrap() != TaskStatus::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            dispatcher.forget_run("run-4").await,
            Err(Error::Validation(_))
        ));

        dispatcher.cancel_run("run-4").await.unwrap();
        for (_, handle) in &run.handles {
            substrate.wait(handle).await.unwrap();
        }
        assert_eq!(dispatcher.forget_run("run-4").await.unwrap(), 6);
        assert!(substrate.status(&process).await.is_err());
        assert!(dispatcher.run_status("run-4").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_run_stops_every_unit() {
        let recorder = Arc::new(Recorder {
            block_process: true,
            ..Default::default()
        });
        let substrate = Arc::new(LocalSubstrate::new(recorder));
        let dispatcher = Dispatcher::new(substrate.clone()).with_retry(TaskRetryPolicy::none());

        let run = dispatcher
            .dispatch("run-3", &request(), Priority::Normal)
            .await
            .unwrap();
        let process = run.handle("process").unwrap().clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while substrate.status(&process).await.unwrap() != TaskStatus::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(dispatcher.cancel_run("run-3").await.unwrap(), 6);
        assert_eq!(substrate.wait(&process).await.unwrap(), TaskStatus::Cancelled);
        let notify = run.handle("notify").unwrap();
        assert_eq!(substrate.wait(notify).await.unwrap(), TaskStatus::Cancelled);
        assert!(dispatcher.cancel_run("unknown").await.is_err());
    }
}
