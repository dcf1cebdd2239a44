use crate::config::SchedulerConfig;
use crate::error::{AgentvisorError, Result};
use crate::process::{LifecycleState, ProcessSpec, ProcessSupervisor, ResourceLimits};
use crate::scheduler::graph::{compute_batches, ExecutionPlan, TaskNode, TaskStatus};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executes a single task attempt
///
/// `cancel` fires when the whole execution is cancelled; runners should stop
/// their work and return `AgentvisorError::Cancelled`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskNode, attempt: u32, cancel: CancellationToken) -> Result<()>;
}

type CommandBuilder = dyn Fn(&TaskNode) -> Vec<String> + Send + Sync;

/// Runs every task attempt as a monitored process
///
/// Process ids are `<task id>-attempt-<n>`; restarts are disabled because the
/// scheduler owns retries. The entry is removed from the supervisor once the
/// attempt ends.
pub struct ProcessTaskRunner {
    supervisor: Arc<ProcessSupervisor>,
    command: Box<CommandBuilder>,
    working_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    resource_limits: ResourceLimits,
}

impl ProcessTaskRunner {
    pub fn new<F>(supervisor: Arc<ProcessSupervisor>, command: F) -> Self
    where
        F: Fn(&TaskNode) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            supervisor,
            command: Box::new(command),
            working_dir: None,
            log_dir: None,
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Limits applied to every task process
    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    fn spec_for(&self, task: &TaskNode, attempt: u32) -> ProcessSpec {
        let process_id = format!("{}-attempt-{}", task.id, attempt);
        let mut spec = ProcessSpec::new(process_id, (self.command)(task))
            .task(task.id.clone(), task.task_type.clone())
            .auto_restart(false)
            .resource_limits(self.resource_limits.clone());
        if let Some(ref dir) = self.working_dir {
            spec = spec.working_dir(dir.clone());
        }
        if let Some(ref dir) = self.log_dir {
            spec = spec.log_dir(dir.clone());
        }
        spec
    }
}

#[async_trait]
impl TaskRunner for ProcessTaskRunner {
    async fn run(&self, task: &TaskNode, attempt: u32, cancel: CancellationToken) -> Result<()> {
        let spec = self.spec_for(task, attempt);
        let process_id = spec.process_id.clone();
        self.supervisor.monitor_process(spec).await?;

        let status = tokio::select! {
            status = self.supervisor.wait_for_terminal(&process_id, None) => status?,
            _ = cancel.cancelled() => {
                info!(task_id = %task.id, "Stopping task process after cancellation");
                self.supervisor.stop_process_monitoring(&process_id, true).await?;
                return Err(AgentvisorError::Cancelled);
            }
        };
        self.supervisor
            .stop_process_monitoring(&process_id, true)
            .await?;

        match (status.lifecycle_state, status.limit_violation) {
            (LifecycleState::Completed, _) => Ok(()),
            (_, Some(violation)) => Err(AgentvisorError::ResourceExceeded(process_id, violation)),
            (state, None) => Err(AgentvisorError::TaskFailed(
                task.id.clone(),
                format!("process {} ended {} with exit code {:?}", process_id, state, status.exit_code),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

impl TaskResult {
    fn not_run(task_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            attempts: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub index: usize,
    pub task_ids: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    /// Parallelism the batch ran with
    pub parallelism: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub results: BTreeMap<String, TaskResult>,
    pub batches: Vec<BatchReport>,
    pub total_duration: Duration,
    pub final_parallelism: usize,
    /// A task failed for good and later batches were skipped
    pub aborted: bool,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }

    /// Succeeded tasks over all tasks in the plan
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        self.count(TaskStatus::Succeeded) as f64 / self.results.len() as f64
    }

    pub fn is_success(&self) -> bool {
        self.results
            .values()
            .all(|r| r.status == TaskStatus::Succeeded)
    }
}

/// Runs execution plans batch by batch, adapting parallelism to batch outcomes
pub struct DependencyScheduler {
    config: SchedulerConfig,
    runner: Arc<dyn TaskRunner>,
}

impl DependencyScheduler {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plan and run `nodes`, updating their status and retry counts
    pub async fn execute(&self, nodes: &mut [TaskNode]) -> Result<ExecutionReport> {
        let plan = compute_batches(nodes)?;
        info!(
            tasks = plan.task_count(),
            batches = plan.batches.len(),
            speedup = plan.estimated_speedup,
            "Execution plan computed"
        );
        self.execute_with_adaptive_monitoring(&plan, nodes, CancellationToken::new())
            .await
    }

    /// Run `plan` batch by batch
    ///
    /// Batches are barriers. Within a batch at most the current parallelism
    /// runs at once; after a batch whose success rate is below
    /// `batch_success_threshold` the parallelism drops by one, never below
    /// `min_parallelism`. A task that exhausts its retries aborts the
    /// remaining batches unless `continue_on_failure` is set, in which case
    /// only its dependents are skipped.
    pub async fn execute_with_adaptive_monitoring(
        &self,
        plan: &ExecutionPlan,
        nodes: &mut [TaskNode],
        cancel: CancellationToken,
    ) -> Result<ExecutionReport> {
        let positions: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.id.clone(), position))
            .collect();
        for id in plan.batches.iter().flatten() {
            if !positions.contains_key(id) {
                return Err(AgentvisorError::Internal(format!(
                    "plan references unknown task {}",
                    id
                )));
            }
        }
        for node in nodes.iter() {
            if let Some(dependency) = node
                .dependency_ids
                .iter()
                .find(|dependency| !positions.contains_key(*dependency))
            {
                return Err(AgentvisorError::UnknownDependency {
                    task: node.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let started = Instant::now();
        let mut parallelism = self.config.max_parallelism.max(1);
        let mut results: BTreeMap<String, TaskResult> = BTreeMap::new();
        let mut batches = Vec::with_capacity(plan.batches.len());
        let mut aborted = false;
        let mut cancelled = false;

        for (index, batch) in plan.batches.iter().enumerate() {
            if aborted || cancelled || cancel.is_cancelled() {
                cancelled |= cancel.is_cancelled();
                let status = if cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Skipped
                };
                for id in batch {
                    nodes[positions[id]].status = status;
                    results.insert(id.clone(), TaskResult::not_run(id, status));
                }
                continue;
            }

            let batch_started = Instant::now();
            let mut runnable = Vec::new();
            for id in batch {
                let node = &nodes[positions[id]];
                let blocked = node.dependency_ids.iter().any(|dependency| {
                    nodes[positions[dependency]].status != TaskStatus::Succeeded
                });
                if blocked {
                    debug!(task_id = %id, "Skipping task with unsuccessful prerequisite");
                    nodes[positions[id]].status = TaskStatus::Skipped;
                    results.insert(id.clone(), TaskResult::not_run(id, TaskStatus::Skipped));
                } else {
                    runnable.push(node.clone());
                }
            }

            info!(
                batch = index,
                tasks = batch.len(),
                runnable = runnable.len(),
                parallelism,
                "Starting batch"
            );

            for (node, result) in self.run_batch(runnable, parallelism, &cancel).await {
                let position = positions[&node.id];
                nodes[position] = node;
                results.insert(result.task_id.clone(), result);
            }

            let count = |status: TaskStatus| {
                batch
                    .iter()
                    .filter(|id| results.get(*id).map(|r| r.status) == Some(status))
                    .count()
            };
            let succeeded = count(TaskStatus::Succeeded);
            let failed = count(TaskStatus::Failed);
            let success_rate = if batch.is_empty() {
                1.0
            } else {
                succeeded as f64 / batch.len() as f64
            };

            batches.push(BatchReport {
                index,
                task_ids: batch.clone(),
                succeeded,
                failed,
                skipped: count(TaskStatus::Skipped),
                cancelled: count(TaskStatus::Cancelled),
                success_rate,
                parallelism,
                duration: batch_started.elapsed(),
            });

            if success_rate < self.config.batch_success_threshold
                && parallelism > self.config.min_parallelism
            {
                parallelism -= 1;
                warn!(
                    batch = index,
                    success_rate, parallelism, "Low batch success rate, reducing parallelism"
                );
            }

            if cancel.is_cancelled() {
                cancelled = true;
            } else if failed > 0 && !self.config.continue_on_failure {
                warn!(batch = index, failed, "Task failed after retries, skipping remaining batches");
                aborted = true;
            }
        }

        let report = ExecutionReport {
            results,
            batches,
            total_duration: started.elapsed(),
            final_parallelism: parallelism,
            aborted,
            cancelled,
        };
        info!(
            succeeded = report.count(TaskStatus::Succeeded),
            failed = report.count(TaskStatus::Failed),
            skipped = report.count(TaskStatus::Skipped),
            cancelled = report.count(TaskStatus::Cancelled),
            duration_ms = report.total_duration.as_millis() as u64,
            "Execution finished"
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        nodes: Vec<TaskNode>,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Vec<(TaskNode, TaskResult)> {
        let semaphore = Semaphore::new(parallelism);
        let mut running = FuturesUnordered::new();

        for node in nodes {
            let semaphore = &semaphore;
            running.push(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire() => permit.ok(),
                };
                match permit {
                    Some(_permit) => self.run_task(node, cancel).await,
                    None => {
                        let result = TaskResult::not_run(&node.id, TaskStatus::Cancelled);
                        let mut node = node;
                        node.status = TaskStatus::Cancelled;
                        (node, result)
                    }
                }
            });
        }

        let mut finished = Vec::new();
        while let Some(outcome) = running.next().await {
            finished.push(outcome);
        }
        finished
    }

    /// Run one task, retrying failed attempts while `retry_count < max_retries`
    async fn run_task(&self, mut node: TaskNode, cancel: &CancellationToken) -> (TaskNode, TaskResult) {
        let started = Instant::now();
        let mut attempts = 0;
        node.status = TaskStatus::Running;

        let (status, error) = loop {
            if cancel.is_cancelled() {
                break (TaskStatus::Cancelled, None);
            }
            attempts += 1;

            match self.runner.run(&node, attempts, cancel.child_token()).await {
                Ok(()) => break (TaskStatus::Succeeded, None),
                Err(AgentvisorError::Cancelled) => break (TaskStatus::Cancelled, None),
                Err(e) if node.retry_count < node.max_retries => {
                    node.retry_count += 1;
                    warn!(
                        task_id = %node.id,
                        attempt = attempts,
                        retry = node.retry_count,
                        "Task attempt failed, retrying: {}",
                        e
                    );
                }
                Err(e) => {
                    warn!(task_id = %node.id, attempts, "Task failed: {}", e);
                    break (TaskStatus::Failed, Some(e.to_string()));
                }
            }
        };

        node.status = status;
        let result = TaskResult {
            task_id: node.id.clone(),
            status,
            attempts,
            duration: started.elapsed(),
            error,
        };
        (node, result)
    }
}
