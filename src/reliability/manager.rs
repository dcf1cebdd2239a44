use crate::config::ReliabilityConfig;
use crate::error::{AgentvisorError, Result};
use crate::reliability::checkpoint::{self, Checkpoint};
use crate::reliability::health::{
    HealthChecker, HealthProbe, SysinfoSystemSampler, SystemHealthCheck, SystemHealthStatus,
    SystemSampler,
};
use crate::reliability::recovery::{recovery_plan, ErrorClass, ErrorHandlingOutcome, RecoveryAction};
use crate::reliability::stages::WorkflowStage;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKFLOW_PREFIX: &str = "workflows";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: WorkflowStage,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Progress of one in-flight workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMonitoringState {
    pub workflow_id: String,
    pub current_stage: WorkflowStage,
    pub stage_start_time: DateTime<Utc>,
    pub stage_history: Vec<StageRecord>,
    pub error_count: u32,
    pub recovery_attempts: u32,
    pub timeout_warnings: u32,
    pub health_checks_performed: u32,
    pub recent_health_checks: VecDeque<SystemHealthCheck>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowMonitoringState {
    fn new(workflow_id: &str) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            current_stage: WorkflowStage::first(),
            stage_start_time: now,
            stage_history: Vec::new(),
            error_count: 0,
            recovery_attempts: 0,
            timeout_warnings: 0,
            health_checks_performed: 0,
            recent_health_checks: VecDeque::new(),
            last_heartbeat: now,
            started_at: now,
        }
    }

    /// Time spent in the current stage
    pub fn stage_elapsed(&self) -> Duration {
        (Utc::now() - self.stage_start_time)
            .to_std()
            .unwrap_or_default()
    }

    fn record_health_check(&mut self, check: SystemHealthCheck, keep: usize) {
        self.health_checks_performed += 1;
        while self.recent_health_checks.len() >= keep.max(1) {
            self.recent_health_checks.pop_front();
        }
        self.recent_health_checks.push_back(check);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TimeoutStatus {
    Healthy {
        elapsed_ms: u64,
        timeout_ms: u64,
    },
    TimeoutWarning {
        elapsed_ms: u64,
        timeout_ms: u64,
        warnings: u32,
    },
    TimeoutDetected {
        elapsed_ms: u64,
        timeout_ms: u64,
        recovery_attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Summary produced when monitoring of a workflow ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDiagnostics {
    pub workflow_id: String,
    pub outcome: WorkflowOutcome,
    pub total_duration_ms: u64,
    pub stage_history: Vec<StageRecord>,
    pub error_count: u32,
    pub recovery_attempts: u32,
    pub timeout_warnings: u32,
    pub health_checks_performed: u32,
    pub last_health_status: Option<SystemHealthStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedWorkflow {
    state: WorkflowMonitoringState,
    context: serde_json::Value,
}

struct WorkflowEntry {
    state: WorkflowMonitoringState,
    context: serde_json::Value,
    last_checkpoint_sequence: i64,
}

impl WorkflowEntry {
    fn new(state: WorkflowMonitoringState, context: serde_json::Value) -> Self {
        Self {
            state,
            context,
            last_checkpoint_sequence: 0,
        }
    }

    /// Checkpoint of the current position, with a key sequence that never repeats
    fn next_checkpoint(&mut self) -> Checkpoint {
        let sequence = Utc::now()
            .timestamp_millis()
            .max(self.last_checkpoint_sequence + 1);
        self.last_checkpoint_sequence = sequence;
        Checkpoint::new(
            self.state.workflow_id.clone(),
            self.state.current_stage,
            self.context.clone(),
            sequence,
        )
    }
}

fn workflow_key(workflow_id: &str) -> String {
    format!("{}/{}", WORKFLOW_PREFIX, workflow_id)
}

/// Tracks workflows through their stages, detects stage timeouts, routes
/// errors to recovery strategies and persists progress
pub struct ReliabilityManager {
    config: ReliabilityConfig,
    store: Arc<dyn StateStore>,
    health: HealthChecker,
    workflows: Mutex<HashMap<String, WorkflowEntry>>,
    pending_writes: Mutex<Vec<JoinHandle<Option<Checkpoint>>>>,
}

impl ReliabilityManager {
    /// Manager sampling the host through sysinfo, without dependency probes
    pub fn new(config: ReliabilityConfig, store: Arc<dyn StateStore>) -> Self {
        Self::with_components(config, store, Box::new(SysinfoSystemSampler::new()), Vec::new())
    }

    pub fn with_components(
        config: ReliabilityConfig,
        store: Arc<dyn StateStore>,
        sampler: Box<dyn SystemSampler>,
        probes: Vec<Arc<dyn HealthProbe>>,
    ) -> Self {
        let health = HealthChecker::new(
            sampler,
            probes,
            config.thresholds.clone(),
            config.probe_timeout(),
        );
        Self {
            config,
            store,
            health,
            workflows: Mutex::new(HashMap::new()),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Register a workflow at the first stage and run an initial health check
    pub async fn start_workflow_monitoring(
        &self,
        workflow_id: &str,
        context: serde_json::Value,
    ) -> Result<WorkflowMonitoringState> {
        {
            let mut workflows = self.workflows.lock().await;
            if workflows.contains_key(workflow_id) {
                return Err(AgentvisorError::WorkflowAlreadyMonitored(
                    workflow_id.to_string(),
                ));
            }
            workflows.insert(
                workflow_id.to_string(),
                WorkflowEntry::new(WorkflowMonitoringState::new(workflow_id), context),
            );
        }

        info!(workflow_id, "Workflow monitoring started");
        let check = self.perform_health_check(workflow_id).await?;
        if !check.is_healthy() {
            warn!(workflow_id, status = %check.status, "Workflow starting on an unhealthy host");
        }

        self.get_workflow_state(workflow_id).await
    }

    /// Move to `stage`, closing the current one in the history, and replace
    /// the stored context when one is given.
    /// Leaving a critical stage writes a checkpoint in the background.
    pub async fn update_workflow_stage(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        let checkpoint = {
            let mut workflows = self.workflows.lock().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;

            if let Some(context) = context {
                entry.context = context;
            }

            let now = Utc::now();
            let previous = entry.state.current_stage;
            let checkpoint = previous.is_critical().then(|| entry.next_checkpoint());

            entry.state.stage_history.push(StageRecord {
                stage: previous,
                started_at: entry.state.stage_start_time,
                ended_at: now,
            });
            entry.state.current_stage = stage;
            entry.state.stage_start_time = now;
            entry.state.last_heartbeat = now;

            info!(workflow_id, from = %previous, to = %stage, "Workflow stage changed");
            checkpoint
        };

        if let Some(checkpoint) = checkpoint {
            self.track(self.spawn_checkpoint_write(checkpoint)).await;
        }
        Ok(())
    }

    /// Replace the context stored with the workflow's checkpoints and snapshots
    pub async fn update_workflow_context(
        &self,
        workflow_id: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        let mut workflows = self.workflows.lock().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        entry.context = context;
        Ok(())
    }

    pub async fn record_heartbeat(&self, workflow_id: &str) -> Result<()> {
        let mut workflows = self.workflows.lock().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        entry.state.last_heartbeat = Utc::now();
        Ok(())
    }

    pub async fn get_workflow_state(&self, workflow_id: &str) -> Result<WorkflowMonitoringState> {
        self.workflows
            .lock()
            .await
            .get(workflow_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))
    }

    pub async fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sample host resources and probe dependencies, bounded by
    /// `health_check_timeout`, and record the result on the workflow
    pub async fn perform_health_check(&self, workflow_id: &str) -> Result<SystemHealthCheck> {
        if !self.workflows.lock().await.contains_key(workflow_id) {
            return Err(AgentvisorError::UnknownWorkflow(workflow_id.to_string()));
        }

        let limit = self.config.health_check_timeout();
        let check = match tokio::time::timeout(limit, self.health.run()).await {
            Ok(check) => check,
            Err(_) => {
                warn!(workflow_id, "Health check timed out after {:?}", limit);
                SystemHealthCheck::timed_out(limit)
            }
        };

        match check.status {
            SystemHealthStatus::Healthy => debug!(workflow_id, "Health check passed"),
            status => warn!(
                workflow_id,
                %status,
                recommendations = ?check.recommendations,
                "Health check reported problems"
            ),
        }

        let mut workflows = self.workflows.lock().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        entry
            .state
            .record_health_check(check.clone(), self.config.recent_health_checks);

        Ok(check)
    }

    /// Compare time spent in the current stage against its timeout
    pub async fn check_workflow_timeouts(&self, workflow_id: &str) -> Result<TimeoutStatus> {
        let (status, checkpoint) = {
            let mut workflows = self.workflows.lock().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;

            let stage = entry.state.current_stage;
            let timeout = self.config.stage_timeout(stage);
            let elapsed = entry.state.stage_elapsed();
            let warning_after = timeout.mul_f64(self.config.warning_fraction);
            let elapsed_ms = elapsed.as_millis() as u64;
            let timeout_ms = timeout.as_millis() as u64;

            if elapsed > timeout {
                if entry.state.recovery_attempts >= self.config.max_recovery_attempts {
                    error!(
                        workflow_id,
                        %stage,
                        elapsed_ms,
                        recovery_attempts = entry.state.recovery_attempts,
                        "Stage timeout with recovery attempts exhausted"
                    );
                    return Err(AgentvisorError::RecoveryExhausted(
                        workflow_id.to_string(),
                        format!(
                            "stage {} exceeded its {} ms timeout after {} recovery attempts",
                            stage, timeout_ms, entry.state.recovery_attempts
                        ),
                    ));
                }
                entry.state.recovery_attempts += 1;
                error!(
                    workflow_id,
                    %stage,
                    elapsed_ms,
                    timeout_ms,
                    "Stage timeout detected, starting recovery"
                );
                (
                    TimeoutStatus::TimeoutDetected {
                        elapsed_ms,
                        timeout_ms,
                        recovery_attempts: entry.state.recovery_attempts,
                    },
                    Some(entry.next_checkpoint()),
                )
            } else if elapsed > warning_after {
                entry.state.timeout_warnings += 1;
                warn!(workflow_id, %stage, elapsed_ms, timeout_ms, "Stage running long");
                (
                    TimeoutStatus::TimeoutWarning {
                        elapsed_ms,
                        timeout_ms,
                        warnings: entry.state.timeout_warnings,
                    },
                    None,
                )
            } else {
                (
                    TimeoutStatus::Healthy {
                        elapsed_ms,
                        timeout_ms,
                    },
                    None,
                )
            }
        };

        if let Some(checkpoint) = checkpoint {
            self.track(self.spawn_checkpoint_write(checkpoint)).await;
            self.perform_health_check(workflow_id).await?;
        }

        Ok(status)
    }

    /// Classify `error`, update the workflow's counters and decide whether
    /// the failed stage is worth retrying
    pub async fn handle_workflow_error(
        &self,
        workflow_id: &str,
        error: &AgentvisorError,
        stage: WorkflowStage,
        context: &serde_json::Value,
    ) -> Result<ErrorHandlingOutcome> {
        let error_class = ErrorClass::classify(error);
        let (mut recovery_actions, mut recommendations) =
            recovery_plan(error_class, stage, self.config.retry_delay());

        let (success, recovery_attempt, checkpoint) = {
            let mut workflows = self.workflows.lock().await;
            let entry = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;

            entry.state.error_count += 1;
            if !context.is_null() {
                entry.context = context.clone();
            }

            let recoverable = error_class.is_recoverable();
            let success =
                recoverable && entry.state.recovery_attempts < self.config.max_recovery_attempts;
            if success {
                entry.state.recovery_attempts += 1;
            }

            let checkpoint = (success
                && recovery_actions.contains(&RecoveryAction::CreateCheckpoint))
            .then(|| entry.next_checkpoint());

            (success, entry.state.recovery_attempts, checkpoint)
        };

        if error_class.is_recoverable() && !success {
            recovery_actions = vec![RecoveryAction::Abort];
            recommendations.push(format!(
                "Recovery attempts exhausted ({}); manual intervention required",
                self.config.max_recovery_attempts
            ));
        }

        if let Some(checkpoint) = checkpoint {
            self.track(self.spawn_checkpoint_write(checkpoint)).await;
        }

        if success {
            warn!(
                workflow_id,
                %stage,
                class = %error_class,
                recovery_attempt,
                "Recoverable workflow error: {}",
                error
            );
        } else {
            error!(workflow_id, %stage, class = %error_class, "Unrecoverable workflow error: {}", error);
        }

        Ok(ErrorHandlingOutcome {
            success,
            error_class,
            stage,
            recovery_actions,
            recommendations,
            recovery_attempt,
        })
    }

    /// Run `op` for `stage`; on a recoverable failure wait as advised and
    /// retry once, otherwise return the error. Each attempt is bounded by the
    /// stage timeout.
    pub async fn run_stage_with_retry<T, F, Fut>(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        context: &serde_json::Value,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let error = match self.attempt_stage(workflow_id, stage, op()).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let outcome = self
            .handle_workflow_error(workflow_id, &error, stage, context)
            .await?;
        if !outcome.success {
            return Err(error);
        }

        if let Some(delay) = outcome.retry_delay() {
            tokio::time::sleep(delay).await;
        }
        info!(workflow_id, %stage, "Retrying stage");

        match self.attempt_stage(workflow_id, stage, op()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // Retry spent: count the error only
                self.record_error(workflow_id, context).await?;
                error!(workflow_id, %stage, "Stage failed after retry: {}", e);
                Err(e)
            }
        }
    }

    async fn attempt_stage<T, Fut>(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        attempt: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.stage_timeout(stage);
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| AgentvisorError::TimeoutDetected {
                workflow_id: workflow_id.to_string(),
                stage: stage.to_string(),
            })?
    }

    async fn record_error(&self, workflow_id: &str, context: &serde_json::Value) -> Result<()> {
        let mut workflows = self.workflows.lock().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        entry.state.error_count += 1;
        if !context.is_null() {
            entry.context = context.clone();
        }
        Ok(())
    }

    /// Write a checkpoint of the workflow's current position in the background
    pub async fn create_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<JoinHandle<Option<Checkpoint>>> {
        let checkpoint = self.next_checkpoint(workflow_id).await?;
        Ok(self.spawn_checkpoint_write(checkpoint))
    }

    /// Write a checkpoint of the workflow's current position and wait for it
    pub async fn write_checkpoint(&self, workflow_id: &str) -> Result<Checkpoint> {
        let checkpoint = self.next_checkpoint(workflow_id).await?;
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || {
            checkpoint::write_checkpoint(store.as_ref(), &checkpoint).map(|()| checkpoint)
        })
        .await
        .map_err(|e| AgentvisorError::Internal(format!("checkpoint writer panicked: {}", e)))?
    }

    pub fn list_checkpoints(&self, workflow_id: &str) -> Result<Vec<Checkpoint>> {
        checkpoint::list_checkpoints(self.store.as_ref(), workflow_id)
    }

    pub fn latest_checkpoint(&self, workflow_id: &str) -> Result<Option<Checkpoint>> {
        checkpoint::latest_checkpoint(self.store.as_ref(), workflow_id)
    }

    /// Wait for every background checkpoint write started so far
    pub async fn flush_checkpoints(&self) {
        let pending: Vec<_> = self.pending_writes.lock().await.drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                error!("Checkpoint writer panicked: {}", e);
            }
        }
    }

    /// Serialize the workflow state and context under `workflows/<id>`
    pub async fn create_workflow_persistence(&self, workflow_id: &str) -> Result<()> {
        let snapshot = {
            let workflows = self.workflows.lock().await;
            let entry = workflows
                .get(workflow_id)
                .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
            PersistedWorkflow {
                state: entry.state.clone(),
                context: entry.context.clone(),
            }
        };

        self.persist(snapshot).await?;
        debug!(workflow_id, "Workflow persisted");
        Ok(())
    }

    /// Load a persisted workflow and register it again, replacing any live entry
    pub async fn restore_workflow_from_persistence(
        &self,
        workflow_id: &str,
    ) -> Result<(WorkflowMonitoringState, serde_json::Value)> {
        let store = Arc::clone(&self.store);
        let id = workflow_id.to_string();
        let (bytes, latest) = tokio::task::spawn_blocking(move || {
            let bytes = store.get(&workflow_key(&id))?;
            let latest = checkpoint::latest_checkpoint(store.as_ref(), &id)?;
            Ok::<_, AgentvisorError>((bytes, latest))
        })
        .await
        .map_err(|e| AgentvisorError::Internal(format!("workflow restore panicked: {}", e)))??;

        let bytes =
            bytes.ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        let PersistedWorkflow { state, context } = serde_json::from_slice(&bytes)
            .map_err(|e| AgentvisorError::DeserializationError(e.to_string()))?;

        let latest_sequence = latest.map(|checkpoint| checkpoint.sequence).unwrap_or(0);

        let mut entry = WorkflowEntry::new(state.clone(), context.clone());
        entry.last_checkpoint_sequence = latest_sequence;
        self.workflows
            .lock()
            .await
            .insert(workflow_id.to_string(), entry);

        info!(workflow_id, stage = %state.current_stage, "Workflow restored");
        Ok((state, context))
    }

    /// End monitoring and report diagnostics; writes a final snapshot when
    /// `persist_on_stop` is set
    pub async fn stop_workflow_monitoring(
        &self,
        workflow_id: &str,
        outcome: WorkflowOutcome,
    ) -> Result<WorkflowDiagnostics> {
        let entry = {
            let mut workflows = self.workflows.lock().await;
            let mut entry = workflows
                .remove(workflow_id)
                .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;

            let now = Utc::now();
            entry.state.stage_history.push(StageRecord {
                stage: entry.state.current_stage,
                started_at: entry.state.stage_start_time,
                ended_at: now,
            });
            entry.state.stage_start_time = now;
            entry.state.last_heartbeat = now;
            entry
        };

        if self.config.persist_on_stop {
            let snapshot = PersistedWorkflow {
                state: entry.state.clone(),
                context: entry.context.clone(),
            };
            if let Err(e) = self.persist(snapshot).await {
                error!(workflow_id, "Final workflow snapshot failed: {}", e);
            }
        }
        self.flush_checkpoints().await;

        let state = entry.state;
        let finished_at = Utc::now();
        let diagnostics = WorkflowDiagnostics {
            workflow_id: state.workflow_id,
            outcome,
            total_duration_ms: (finished_at - state.started_at)
                .to_std()
                .unwrap_or_default()
                .as_millis() as u64,
            stage_history: state.stage_history,
            error_count: state.error_count,
            recovery_attempts: state.recovery_attempts,
            timeout_warnings: state.timeout_warnings,
            health_checks_performed: state.health_checks_performed,
            last_health_status: state.recent_health_checks.back().map(|check| check.status),
            started_at: state.started_at,
            finished_at,
        };

        info!(
            workflow_id,
            ?outcome,
            total_duration_ms = diagnostics.total_duration_ms,
            errors = diagnostics.error_count,
            "Workflow monitoring stopped"
        );
        Ok(diagnostics)
    }

    async fn next_checkpoint(&self, workflow_id: &str) -> Result<Checkpoint> {
        let mut workflows = self.workflows.lock().await;
        let entry = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| AgentvisorError::UnknownWorkflow(workflow_id.to_string()))?;
        Ok(entry.next_checkpoint())
    }

    fn spawn_checkpoint_write(&self, checkpoint: Checkpoint) -> JoinHandle<Option<Checkpoint>> {
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || {
            match checkpoint::write_checkpoint(store.as_ref(), &checkpoint) {
                Ok(()) => {
                    debug!(
                        workflow_id = %checkpoint.workflow_id,
                        stage = %checkpoint.stage,
                        "Checkpoint written"
                    );
                    Some(checkpoint)
                }
                Err(e) => {
                    error!(
                        workflow_id = %checkpoint.workflow_id,
                        "Checkpoint write failed: {}", e
                    );
                    None
                }
            }
        })
    }

    async fn track(&self, handle: JoinHandle<Option<Checkpoint>>) {
        let mut pending = self.pending_writes.lock().await;
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    async fn persist(&self, snapshot: PersistedWorkflow) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| AgentvisorError::SerializationError(e.to_string()))?;
        let key = workflow_key(&snapshot.state.workflow_id);
        let store = Arc::clone(&self.store);

        tokio::task::spawn_blocking(move || store.put(&key, &bytes))
            .await
            .map_err(|e| AgentvisorError::Internal(format!("workflow persist panicked: {}", e)))?
    }
}
