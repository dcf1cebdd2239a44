use crate::process::alerts::Alert;
use crate::process::restart::RestartTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Child;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Running,
    Paused,
    Completing,
    Completed,
    Failed,
    Terminated,
    Recovering,
}

impl LifecycleState {
    /// Terminal states are eligible for reaping and never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Failed | LifecycleState::Terminated
        )
    }

    /// States counted as active in the system summary
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Paused => write!(f, "paused"),
            LifecycleState::Completing => write!(f, "completing"),
            LifecycleState::Completed => write!(f, "completed"),
            LifecycleState::Failed => write!(f, "failed"),
            LifecycleState::Terminated => write!(f, "terminated"),
            LifecycleState::Recovering => write!(f, "recovering"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Warning => write!(f, "warning"),
            HealthState::Critical => write!(f, "critical"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

/// What to do when a process exceeds a hard resource limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Only raise an alert
    #[default]
    Log,
    /// Kill the process and let the restart policy bring it back
    Restart,
    /// Terminate the process for good
    Stop,
}

/// Hard limits enforced by the polling loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum resident memory in MB
    pub max_memory_mb: Option<f64>,
    /// Maximum CPU percentage
    pub max_cpu_percent: Option<f64>,
    /// Maximum number of open file descriptors
    pub max_open_files: Option<u64>,
    pub limit_action: LimitAction,
}

impl ResourceLimits {
    pub fn new(max_memory_mb: Option<f64>, max_cpu_percent: Option<f64>) -> Self {
        Self {
            max_memory_mb,
            max_cpu_percent,
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: LimitAction) -> Self {
        self.limit_action = action;
        self
    }

    /// First limit the sample violates, if any
    pub fn violation(&self, usage: &ResourceUsage) -> Option<LimitViolation> {
        if let Some(max) = self.max_memory_mb {
            if usage.memory_mb > max {
                return Some(LimitViolation {
                    resource: "memory",
                    limit: max,
                    value: usage.memory_mb,
                });
            }
        }
        if let Some(max) = self.max_cpu_percent {
            if usage.cpu_percent > max {
                return Some(LimitViolation {
                    resource: "cpu",
                    limit: max,
                    value: usage.cpu_percent,
                });
            }
        }
        if let Some(max) = self.max_open_files {
            if usage.open_files > max {
                return Some(LimitViolation {
                    resource: "open_files",
                    limit: max as f64,
                    value: usage.open_files as f64,
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub resource: &'static str,
    pub limit: f64,
    pub value: f64,
}

impl std::fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {:.1} exceeds limit {:.1}",
            self.resource, self.value, self.limit
        )
    }
}

/// Soft thresholds driving health classification and alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub open_files: u64,
    pub thread_count: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_mb: 1024.0,
            open_files: 1000,
            thread_count: 200,
        }
    }
}

/// A single resource sample for one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    /// Cumulative bytes read and written
    pub disk_io_bytes: u64,
    pub open_files: u64,
    pub thread_count: u64,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceUsage {
    pub fn new(cpu_percent: f64, memory_mb: f64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
            disk_io_bytes: 0,
            open_files: 0,
            thread_count: 1,
            sampled_at: Utc::now(),
        }
    }
}

/// Everything needed to launch a monitored process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Caller-chosen unique identifier
    pub process_id: String,

    /// Program followed by its arguments
    pub command: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Scheduler task this process executes, injected as `TASK_ID`
    #[serde(default)]
    pub task_id: Option<String>,

    /// Task type used for per-type summaries
    #[serde(default)]
    pub task_type: Option<String>,

    #[serde(default)]
    pub resource_limits: ResourceLimits,

    #[serde(default)]
    pub alert_thresholds: AlertThresholds,

    /// Overrides the supervisor-wide auto-restart setting
    #[serde(default)]
    pub auto_restart: Option<bool>,

    /// Directory receiving `<process_id>-out.log` and `<process_id>-err.log`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, S>(process_id: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            process_id: process_id.into(),
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: HashMap::new(),
            task_id: None,
            task_type: None,
            resource_limits: ResourceLimits::default(),
            alert_thresholds: AlertThresholds::default(),
            auto_restart: None,
            log_dir: None,
        }
    }

    /// Convenience for `sh -c <script>`
    pub fn shell(process_id: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(process_id, ["/bin/sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.task_type = Some(task_type.into());
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.alert_thresholds = thresholds;
        self
    }

    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = Some(enabled);
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Registry entry owned by the supervisor
#[derive(Debug)]
pub(crate) struct MonitoredProcess {
    pub spec: ProcessSpec,
    pub pid: Option<u32>,
    pub lifecycle_state: LifecycleState,
    pub health_state: HealthState,
    pub resource_usage: Option<ResourceUsage>,
    pub metrics_history: VecDeque<ResourceUsage>,
    pub alerts: Vec<Alert>,
    pub restart_count: u32,
    pub restart_tracker: RestartTracker,
    pub restart_due: Option<Instant>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Last resource limit breach of the current run
    pub limit_violation: Option<String>,
    /// Taken out while a caller stops the process outside the lock
    pub child: Option<Child>,
    pub stop_requested: bool,
}

impl MonitoredProcess {
    pub fn reserve(spec: ProcessSpec) -> Self {
        let now = Utc::now();
        Self {
            spec,
            pid: None,
            lifecycle_state: LifecycleState::Initializing,
            health_state: HealthState::Unknown,
            resource_usage: None,
            metrics_history: VecDeque::new(),
            alerts: Vec::new(),
            restart_count: 0,
            restart_tracker: RestartTracker::new(),
            restart_due: None,
            last_heartbeat: now,
            started_at: now,
            terminal_at: None,
            exit_code: None,
            limit_violation: None,
            child: None,
            stop_requested: false,
        }
    }

    pub fn mark_running(&mut self, child: Child, pid: u32) {
        self.child = Some(child);
        self.pid = Some(pid);
        self.lifecycle_state = LifecycleState::Running;
        self.health_state = HealthState::Healthy;
        self.started_at = Utc::now();
        self.last_heartbeat = self.started_at;
        self.exit_code = None;
        self.limit_violation = None;
        self.restart_due = None;
    }

    pub fn mark_terminal(&mut self, state: LifecycleState) {
        self.lifecycle_state = state;
        self.terminal_at = Some(Utc::now());
        self.restart_due = None;
        self.child = None;
    }

    pub fn record_sample(&mut self, usage: ResourceUsage, history_len: usize) {
        self.last_heartbeat = usage.sampled_at;
        if self.metrics_history.len() >= history_len {
            self.metrics_history.pop_front();
        }
        self.metrics_history.push_back(usage.clone());
        self.resource_usage = Some(usage);
    }

    pub fn snapshot(&self) -> ProcessStatus {
        ProcessStatus {
            process_id: self.spec.process_id.clone(),
            pid: self.pid,
            task_id: self.spec.task_id.clone(),
            task_type: self.spec.task_type.clone(),
            lifecycle_state: self.lifecycle_state,
            health_state: self.health_state,
            resource_limits: self.spec.resource_limits.clone(),
            alert_thresholds: self.spec.alert_thresholds.clone(),
            resource_usage: self.resource_usage.clone(),
            alerts: self.alerts.clone(),
            restart_count: self.restart_count,
            exit_code: self.exit_code,
            limit_violation: self.limit_violation.clone(),
            last_heartbeat: self.last_heartbeat,
            started_at: self.started_at,
            terminal_at: self.terminal_at,
        }
    }
}

/// Snapshot of a monitored process handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub process_id: String,
    pub pid: Option<u32>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub health_state: HealthState,
    pub resource_limits: ResourceLimits,
    pub alert_thresholds: AlertThresholds,
    pub resource_usage: Option<ResourceUsage>,
    pub alerts: Vec<Alert>,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
    pub limit_violation: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        self.lifecycle_state.is_terminal()
    }
}
