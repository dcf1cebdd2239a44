use crate::error::{AgentvisorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One unit of work in the task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub task_type: String,
    pub estimated_duration: Duration,
    pub predicted_success_rate: f64,
    /// Prerequisites that must succeed before this task runs
    #[serde(default)]
    pub dependency_ids: BTreeSet<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub status: TaskStatus,
}

impl TaskNode {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        task_type: impl Into<String>,
        estimated_duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            task_type: task_type.into(),
            estimated_duration,
            predicted_success_rate: 1.0,
            dependency_ids: BTreeSet::new(),
            retry_count: 0,
            max_retries: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependency_ids.insert(id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn predicted_success_rate(mut self, rate: f64) -> Self {
        self.predicted_success_rate = rate;
        self
    }
}

/// Ordered execution batches; each batch only depends on earlier ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Vec<String>>,
    pub estimated_sequential_duration: Duration,
    pub estimated_parallel_duration: Duration,
    pub estimated_speedup: f64,
}

impl ExecutionPlan {
    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn batch_index(&self, task_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|id| id == task_id))
    }
}

/// Group `nodes` into dependency-ordered batches (Kahn's algorithm)
///
/// Rejects duplicate ids, unknown prerequisites and cycles; a cyclic graph
/// never yields a partial plan.
pub fn compute_batches(nodes: &[TaskNode]) -> Result<ExecutionPlan> {
    let mut by_id: HashMap<&str, &TaskNode> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            return Err(AgentvisorError::DuplicateTask(node.id.clone()));
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        in_degree.entry(node.id.as_str()).or_insert(0);
        for dependency in &node.dependency_ids {
            if !by_id.contains_key(dependency.as_str()) {
                return Err(AgentvisorError::UnknownDependency {
                    task: node.id.clone(),
                    dependency: dependency.clone(),
                });
            }
            *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();

        for id in &ready {
            for dependent in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }

        placed += ready.len();
        batches.push(ready.iter().map(|id| id.to_string()).collect());
        ready = next;
    }

    if placed < nodes.len() {
        let placed_ids: HashSet<&str> = batches
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let mut remaining: Vec<String> = nodes
            .iter()
            .filter(|node| !placed_ids.contains(node.id.as_str()))
            .map(|node| node.id.clone())
            .collect();
        remaining.sort();
        return Err(AgentvisorError::Cycle(remaining));
    }

    let sequential: Duration = nodes.iter().map(|node| node.estimated_duration).sum();
    let parallel: Duration = batches
        .iter()
        .map(|batch| {
            batch
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|node| node.estimated_duration)
                .max()
                .unwrap_or_default()
        })
        .sum();
    let speedup = if parallel.is_zero() {
        1.0
    } else {
        sequential.as_secs_f64() / parallel.as_secs_f64()
    };

    Ok(ExecutionPlan {
        batches,
        estimated_sequential_duration: sequential,
        estimated_parallel_duration: parallel,
        estimated_speedup: speedup,
    })
}
