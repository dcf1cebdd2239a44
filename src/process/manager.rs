use crate::config::SupervisorConfig;
use crate::error::{AgentvisorError, Result};
use crate::process::alerts::{record_alert, Alert, AlertSeverity, AlertType};
use crate::process::restart::RestartPolicy;
use crate::process::spawner::SpawnedProcess;
use crate::process::types::{
    AlertThresholds, HealthState, LifecycleState, LimitAction, MonitoredProcess, ProcessSpec,
    ProcessStatus, ResourceUsage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Aggregate view over every registered process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSummary {
    pub total_processes: usize,
    pub active_processes: usize,
    pub total_cpu_percent: f64,
    pub total_memory_mb: f64,
    pub total_restarts: u64,
    pub unacknowledged_alerts: BTreeMap<AlertSeverity, usize>,
    pub average_cpu_by_task_type: BTreeMap<String, f64>,
    pub generated_at: DateTime<Utc>,
}

/// Outcome of an observed process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    Completed,
    RestartScheduled,
    Exhausted,
}

/// Action the polling loop must carry out outside the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LimitEnforcement {
    Restart { process_id: String, pid: u32 },
    Stop { process_id: String },
}

const UNTYPED_TASK: &str = "untyped";

/// In-memory registry of monitored processes
///
/// Every method is synchronous; the supervisor holds its lock only while
/// calling into the registry and performs OS work in between.
pub(crate) struct ProcessRegistry {
    processes: HashMap<String, MonitoredProcess>,
    config: SupervisorConfig,
    last_cleanup: Instant,
}

impl ProcessRegistry {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            processes: HashMap::new(),
            config,
            last_cleanup: Instant::now(),
        }
    }

    /// Claim `spec.process_id` in INITIALIZING before the spawn happens
    pub fn reserve(&mut self, spec: ProcessSpec) -> Result<()> {
        if self.processes.contains_key(&spec.process_id) {
            return Err(AgentvisorError::AlreadyMonitored(spec.process_id));
        }
        self.processes
            .insert(spec.process_id.clone(), MonitoredProcess::reserve(spec));
        Ok(())
    }

    /// Drop a reservation whose spawn failed
    pub fn release(&mut self, process_id: &str) {
        self.processes.remove(process_id);
    }

    /// Attach a freshly spawned child. Hands the child back when the entry
    /// was stopped or removed while the spawn was in flight.
    pub fn install(
        &mut self,
        process_id: &str,
        spawned: SpawnedProcess,
    ) -> std::result::Result<(), Child> {
        match self.processes.get_mut(process_id) {
            Some(process) if !process.stop_requested && !process.lifecycle_state.is_terminal() => {
                process.mark_running(spawned.child, spawned.pid);
                Ok(())
            }
            _ => Err(spawned.child),
        }
    }

    pub fn get(&self, process_id: &str) -> Option<&MonitoredProcess> {
        self.processes.get(process_id)
    }

    pub fn get_mut(&mut self, process_id: &str) -> Option<&mut MonitoredProcess> {
        self.processes.get_mut(process_id)
    }

    pub fn remove(&mut self, process_id: &str) -> Option<MonitoredProcess> {
        self.processes.remove(process_id)
    }

    pub fn statuses(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<ProcessStatus> =
            self.processes.values().map(|p| p.snapshot()).collect();
        statuses.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        statuses
    }

    /// PIDs of processes that currently own a live child
    pub fn live_pids(&self) -> Vec<(String, u32)> {
        self.processes
            .iter()
            .filter(|(_, p)| {
                p.child.is_some()
                    && matches!(
                        p.lifecycle_state,
                        LifecycleState::Running | LifecycleState::Paused
                    )
            })
            .filter_map(|(id, p)| p.pid.map(|pid| (id.clone(), pid)))
            .collect()
    }

    /// Non-blocking check of every child for an exit status
    pub fn collect_exits(&mut self) -> Vec<(String, Option<i32>)> {
        let mut exits = Vec::new();

        for (id, process) in self.processes.iter_mut() {
            let Some(child) = process.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(process_id = %id, ?status, "Process exited");
                    process.child = None;
                    exits.push((id.clone(), status.code()));
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll process {}: {}", id, e),
            }
        }

        exits
    }

    /// Apply the lifecycle transition for an exit and queue alerts to dispatch
    pub fn apply_exit(
        &mut self,
        process_id: &str,
        exit_code: Option<i32>,
        alerts: &mut Vec<Alert>,
    ) -> Option<ExitOutcome> {
        let window = self.config.alert_dedup_window();
        let process = self.processes.get_mut(process_id)?;
        process.exit_code = exit_code;

        if exit_code == Some(0) {
            info!(process_id, "Process completed");
            process.mark_terminal(LifecycleState::Completed);
            return Some(ExitOutcome::Completed);
        }

        process.lifecycle_state = LifecycleState::Failed;
        let policy = RestartPolicy::from_config(&self.config, process.spec.auto_restart);

        if policy.should_restart(&process.restart_tracker) {
            let delay = policy.calculate_delay(&process.restart_tracker);
            process.lifecycle_state = LifecycleState::Recovering;
            process.restart_due = Some(Instant::now() + delay);
            info!(
                process_id,
                ?exit_code,
                restart_count = process.restart_count,
                "Process failed, restart scheduled in {:?}",
                delay
            );
            Self::push_alert(
                process,
                Alert::new(
                    process_id,
                    AlertType::Process,
                    AlertSeverity::Warning,
                    "Process exited with failure, restart scheduled",
                    0.0,
                    f64::from(exit_code.unwrap_or(-1)),
                ),
                window,
                alerts,
            );
            return Some(ExitOutcome::RestartScheduled);
        }

        process.mark_terminal(LifecycleState::Failed);
        let message = if policy.enabled {
            warn!(
                process_id,
                restart_count = process.restart_count,
                "Restart attempts exhausted, process settled in failed state"
            );
            "Restart attempts exhausted"
        } else {
            warn!(process_id, ?exit_code, "Process failed");
            "Process exited with failure"
        };
        Self::push_alert(
            process,
            Alert::new(
                process_id,
                AlertType::Process,
                AlertSeverity::Critical,
                message,
                f64::from(policy.max_attempts),
                f64::from(process.restart_count),
            ),
            window,
            alerts,
        );

        Some(ExitOutcome::Exhausted)
    }

    /// Record a sample, reclassify health and evaluate alert and limit conditions
    pub fn apply_sample(
        &mut self,
        process_id: &str,
        usage: Option<ResourceUsage>,
        alerts: &mut Vec<Alert>,
    ) -> Option<LimitEnforcement> {
        let window = self.config.alert_dedup_window();
        let warning_ratio = self.config.warning_ratio;
        let critical_ratio = self.config.critical_ratio;
        let history_len = self.config.metrics_history_len;

        let process = self.processes.get_mut(process_id)?;

        let Some(usage) = usage else {
            process.health_state = HealthState::Unknown;
            return None;
        };

        process.record_sample(usage.clone(), history_len);

        if process.lifecycle_state != LifecycleState::Running {
            return None;
        }

        let metrics = resource_metrics(&usage, &process.spec.alert_thresholds);
        process.health_state = classify_health(&metrics, warning_ratio, critical_ratio);

        for metric in &metrics {
            if metric.threshold <= 0.0 || metric.value <= metric.threshold {
                continue;
            }
            let (severity, message) = if metric.value > metric.threshold * critical_ratio {
                (AlertSeverity::Critical, format!("{} critically above threshold", metric.label))
            } else {
                (AlertSeverity::Warning, format!("{} above threshold", metric.label))
            };
            let alert = Alert::new(
                process_id,
                metric.alert_type,
                severity,
                message,
                metric.threshold,
                metric.value,
            );
            Self::push_alert(process, alert, window, alerts);
        }

        let violation = process.spec.resource_limits.violation(&usage)?;
        let alert = Alert::new(
            process_id,
            AlertType::Resource,
            AlertSeverity::Critical,
            format!("Resource limit exceeded: {}", violation.resource),
            violation.limit,
            violation.value,
        );
        Self::push_alert(process, alert, window, alerts);
        warn!(process_id, "{}", violation);
        process.limit_violation = Some(violation.to_string());

        match process.spec.resource_limits.limit_action {
            LimitAction::Log => None,
            LimitAction::Restart => process.pid.map(|pid| LimitEnforcement::Restart {
                process_id: process_id.to_string(),
                pid,
            }),
            LimitAction::Stop if process.stop_requested => None,
            LimitAction::Stop => {
                process.stop_requested = true;
                Some(LimitEnforcement::Stop {
                    process_id: process_id.to_string(),
                })
            }
        }
    }

    /// Specs whose restart backoff has elapsed; counts the attempt immediately
    pub fn take_due_restarts(&mut self, now: Instant) -> Vec<ProcessSpec> {
        let mut due = Vec::new();

        for process in self.processes.values_mut() {
            let is_due = process.lifecycle_state == LifecycleState::Recovering
                && !process.stop_requested
                && process.restart_due.is_some_and(|at| at <= now);
            if !is_due {
                continue;
            }
            process.restart_due = None;
            process.restart_count += 1;
            process.restart_tracker.record_restart();
            due.push(process.spec.clone());
        }

        due
    }

    /// A restart spawn failed; treat it like another failed run
    pub fn apply_restart_failure(
        &mut self,
        process_id: &str,
        error: &AgentvisorError,
        alerts: &mut Vec<Alert>,
    ) -> Option<ExitOutcome> {
        let window = self.config.alert_dedup_window();
        {
            let process = self.processes.get_mut(process_id)?;
            if process.stop_requested || process.lifecycle_state.is_terminal() {
                return None;
            }
            warn!(process_id, "Restart failed: {}", error);
            Self::push_alert(
                process,
                Alert::new(
                    process_id,
                    AlertType::Process,
                    AlertSeverity::Critical,
                    "Restart spawn failed",
                    0.0,
                    f64::from(process.restart_count),
                ),
                window,
                alerts,
            );
        }
        self.apply_exit(process_id, None, alerts)
    }

    /// Mark every alert of a process as acknowledged
    pub fn acknowledge(&mut self, process_id: &str) -> Result<usize> {
        let process = self
            .processes
            .get_mut(process_id)
            .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))?;

        let mut count = 0;
        for alert in process.alerts.iter_mut().filter(|a| !a.acknowledged) {
            alert.acknowledged = true;
            count += 1;
        }
        Ok(count)
    }

    /// Remove entries that have been terminal for longer than the reap window
    pub fn reap(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let reap_after = chrono::Duration::from_std(self.config.reap_after())
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let expired: Vec<String> = self
            .processes
            .iter()
            .filter(|(_, p)| {
                p.lifecycle_state.is_terminal()
                    && p.terminal_at.is_some_and(|at| now - at >= reap_after)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.processes.remove(id);
        }
        self.last_cleanup = Instant::now();

        expired
    }

    pub fn cleanup_due(&self) -> bool {
        self.last_cleanup.elapsed() >= self.config.cleanup_interval()
    }

    pub fn summary(&self) -> SystemSummary {
        let mut summary = SystemSummary {
            total_processes: self.processes.len(),
            active_processes: 0,
            total_cpu_percent: 0.0,
            total_memory_mb: 0.0,
            total_restarts: 0,
            unacknowledged_alerts: BTreeMap::new(),
            average_cpu_by_task_type: BTreeMap::new(),
            generated_at: Utc::now(),
        };
        let mut cpu_by_type: BTreeMap<String, (f64, usize)> = BTreeMap::new();

        for process in self.processes.values() {
            summary.total_restarts += u64::from(process.restart_count);

            for alert in process.alerts.iter().filter(|a| !a.acknowledged) {
                *summary.unacknowledged_alerts.entry(alert.severity).or_insert(0) += 1;
            }

            if !process.lifecycle_state.is_active() {
                continue;
            }
            summary.active_processes += 1;

            if let Some(ref usage) = process.resource_usage {
                summary.total_cpu_percent += usage.cpu_percent;
                summary.total_memory_mb += usage.memory_mb;

                let task_type = process
                    .spec
                    .task_type
                    .clone()
                    .unwrap_or_else(|| UNTYPED_TASK.to_string());
                let entry = cpu_by_type.entry(task_type).or_insert((0.0, 0));
                entry.0 += usage.cpu_percent;
                entry.1 += 1;
            }
        }

        summary.average_cpu_by_task_type = cpu_by_type
            .into_iter()
            .map(|(task_type, (total, count))| (task_type, total / count as f64))
            .collect();

        summary
    }

    fn push_alert(
        process: &mut MonitoredProcess,
        alert: Alert,
        window: std::time::Duration,
        dispatch: &mut Vec<Alert>,
    ) {
        if record_alert(&mut process.alerts, alert.clone(), window) {
            dispatch.push(alert);
        }
    }
}

struct Metric {
    label: &'static str,
    alert_type: AlertType,
    value: f64,
    threshold: f64,
}

fn resource_metrics(usage: &ResourceUsage, thresholds: &AlertThresholds) -> [Metric; 4] {
    [
        Metric {
            label: "CPU usage",
            alert_type: AlertType::Resource,
            value: usage.cpu_percent,
            threshold: thresholds.cpu_percent,
        },
        Metric {
            label: "Memory usage",
            alert_type: AlertType::Resource,
            value: usage.memory_mb,
            threshold: thresholds.memory_mb,
        },
        Metric {
            label: "Open files",
            alert_type: AlertType::Resource,
            value: usage.open_files as f64,
            threshold: thresholds.open_files as f64,
        },
        Metric {
            label: "Thread count",
            alert_type: AlertType::Performance,
            value: usage.thread_count as f64,
            threshold: thresholds.thread_count as f64,
        },
    ]
}

/// CRITICAL above `critical_ratio` x threshold, WARNING above `warning_ratio` x threshold
fn classify_health(metrics: &[Metric], warning_ratio: f64, critical_ratio: f64) -> HealthState {
    let worst = metrics
        .iter()
        .filter(|m| m.threshold > 0.0)
        .map(|m| m.value / m.threshold)
        .fold(0.0_f64, f64::max);

    if worst > critical_ratio {
        HealthState::Critical
    } else if worst > warning_ratio {
        HealthState::Warning
    } else {
        HealthState::Healthy
    }
}
