//! Mapping a run onto a graph of dispatchable units.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::types::{Priority, QueueName};
use crate::pipeline::{PipelineRequest, Stage};
use crate::{Error, Result};

/// What a unit does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    Download { url: String, index: usize },
    /// Fan-in point after the per-URL downloads.
    Aggregate,
    Process,
    Merge,
    Notify,
}

impl UnitKind {
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Download { .. } => QueueName::Download,
            Self::Aggregate => QueueName::Default,
            Self::Process => QueueName::Processing,
            Self::Merge => QueueName::Merge,
            Self::Notify => QueueName::Notifications,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// Unique within the graph.
    pub id: String,
    pub run_id: String,
    pub kind: UnitKind,
    pub priority: Priority,
    pub queue: QueueName,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    units: Vec<TaskUnit>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for one run.
    ///
    /// Stages are chained. Downloads fan out per URL and join at an
    /// aggregation unit. A notification unit at normal priority closes the
    /// graph.
    pub fn for_run(run_id: &str, request: &PipelineRequest, priority: Priority) -> Self {
        let mut graph = Self::new();
        let mut tail: Vec<String> = Vec::new();

        for stage in request.stages() {
            match stage {
                Stage::Download => {
                    let downloads: Vec<String> = request
                        .urls
                        .iter()
                        .enumerate()
                        .map(|(index, url)| {
                            graph.push(
                                run_id,
                                format!("download_{}", index),
                                UnitKind::Download {
                                    url: url.clone(),
                                    index,
                                },
                                priority,
                                tail.clone(),
                            )
                        })
                        .collect();
                    tail = vec![graph.push(
                        run_id,
                        "aggregate".to_string(),
                        UnitKind::Aggregate,
                        priority,
                        downloads,
                    )];
                }
                Stage::Process => {
                    tail = vec![graph.push(
                        run_id,
                        "process".to_string(),
                        UnitKind::Process,
                        priority,
                        tail,
                    )];
                }
                Stage::Merge => {
                    tail = vec![graph.push(
                        run_id,
                        "merge".to_string(),
                        UnitKind::Merge,
                        priority,
                        tail,
                    )];
                }
            }
        }

        graph.push(
            run_id,
            "notify".to_string(),
            UnitKind::Notify,
            Priority::Normal,
            tail,
        );
        graph
    }

    fn push(
        &mut self,
        run_id: &str,
        id: String,
        kind: UnitKind,
        priority: Priority,
        depends_on: Vec<String>,
    ) -> String {
        let queue = kind.queue();
        self.units.push(TaskUnit {
            id: id.clone(),
            run_id: run_id.to_string(),
            kind,
            priority,
            queue,
            depends_on,
        });
        id
    }

    /// Add a unit; ids must be unique.
    pub fn add_unit(&mut self, unit: TaskUnit) -> Result<()> {
        if self.get(&unit.id).is_some() {
            return Err(Error::validation(format!("duplicate unit id '{}'", unit.id)));
        }
        self.units.push(unit);
        Ok(())
    }

    pub fn units(&self) -> &[TaskUnit] {
        &self.units
    }

    pub fn get(&self, id: &str) -> Option<&TaskUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units ordered so each comes after its dependencies.
    ///
    /// Ties keep insertion order. Unknown dependencies and cycles are errors.
    pub fn topological_order(&self) -> Result<Vec<&TaskUnit>> {
        let index: HashMap<&str, usize> = self
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.units.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.units.len()];
        for (i, unit) in self.units.iter().enumerate() {
            for dep in &unit.depends_on {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(Error::validation(format!(
                        "unit '{}' depends on unknown unit '{}'",
                        unit.id, dep
                    )));
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.units.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.units.len());
        while let Some(i) = ready.pop_front() {
            order.push(&self.units[i]);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.units.len() {
            return Err(Error::validation("unit graph contains a cycle"));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProcessingMode;

    fn ids(units: &[&TaskUnit]) -> Vec<String> {
        units.iter().map(|u| u.id.clone()).collect()
    }

    #[test]
    fn test_full_pipeline_graph() {
        let request = PipelineRequest {
            urls: vec!["https://a/1.mp4".into(), "https://a/2.mp4".into()],
            merge_episodes: true,
            ..Default::default()
        };
        let graph = TaskGraph::for_run("r1", &request, Priority::High);
        let order = graph.topological_order().unwrap();
        assert_eq!(
            ids(&order),
            vec!["download_0", "download_1", "aggregate", "process", "merge", "notify"]
        );

        let aggregate = graph.get("aggregate").unwrap();
        assert_eq!(aggregate.depends_on, vec!["download_0", "download_1"]);
        assert_eq!(graph.get("process").unwrap().queue, QueueName::Processing);
        assert_eq!(graph.get("merge").unwrap().priority, Priority::High);

        let notify = graph.get("notify").unwrap();
        assert_eq!(notify.priority, Priority::Normal);
        assert_eq!(notify.queue, QueueName::Notifications);
        assert_eq!(notify.depends_on, vec!["merge"]);
    }

    #[test]
    fn test_process_only_graph() {
        let request = PipelineRequest::process(vec!["a.mp4".into()])
            .with_mode(ProcessingMode::ProcessOnly);
        let graph = TaskGraph::for_run("r2", &request, Priority::Low);
        assert_eq!(graph.len(), 2);
        assert!(graph.get("process").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_cycle_and_unknown_dependency_rejected() {
        let unit = |id: &str, deps: &[&str]| TaskUnit {
            id: id.to_string(),
            run_id: "r".to_string(),
            kind: UnitKind::Process,
            priority: Priority::Normal,
            queue: QueueName::Processing,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        };

        let mut graph = TaskGraph::new();
        graph.add_unit(unit("a", &["b"])).unwrap();
        graph.add_unit(unit("b", &["a"])).unwrap();
        assert!(graph.topological_order().is_err());
        assert!(graph.add_unit(unit("a", &[])).is_err());

        let mut graph = TaskGraph::new();
        graph.add_unit(unit("a", &["missing"])).unwrap();
        assert!(graph.topological_order().is_err());
    }
}
