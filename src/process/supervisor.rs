use crate::config::SupervisorConfig;
use crate::error::{AgentvisorError, Result};
use crate::process::alerts::{Alert, AlertSink, TracingAlertSink};
use crate::process::manager::{ExitOutcome, LimitEnforcement, ProcessRegistry, SystemSummary};
use crate::process::monitor::{ResourceSampler, SysinfoSampler};
use crate::process::spawner::spawn_process;
use crate::process::types::{LifecycleState, ProcessSpec, ProcessStatus, ResourceUsage};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Signals the supervisor sends to monitored processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessSignal {
    Interrupt,
    Kill,
    Stop,
    Continue,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) -> Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        ProcessSignal::Interrupt => Signal::SIGINT,
        ProcessSignal::Kill => Signal::SIGKILL,
        ProcessSignal::Stop => Signal::SIGSTOP,
        ProcessSignal::Continue => Signal::SIGCONT,
    };
    let raw_pid = i32::try_from(pid)
        .map_err(|_| AgentvisorError::SignalError(format!("PID {} out of range", pid)))?;

    signal::kill(Pid::from_raw(raw_pid), nix_signal).map_err(|e| {
        AgentvisorError::SignalError(format!("Failed to send {:?} to PID {}: {}", nix_signal, pid, e))
    })
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: ProcessSignal) -> Result<()> {
    Err(AgentvisorError::SignalError(format!(
        "{:?} for PID {} is not supported on this platform",
        signal, pid
    )))
}

/// Interrupt, wait up to `timeout`, then force-kill. Returns the exit code.
async fn terminate_child(
    process_id: &str,
    mut child: Child,
    was_paused: bool,
    timeout: Duration,
) -> Result<Option<i32>> {
    if let Some(pid) = child.id() {
        if was_paused {
            if let Err(e) = send_signal(pid, ProcessSignal::Continue) {
                debug!(process_id, "Resume before stop failed: {}", e);
            }
        }

        match send_signal(pid, ProcessSignal::Interrupt) {
            Ok(()) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => return Ok(status.code()),
                Ok(Err(e)) => {
                    return Err(AgentvisorError::StopError(
                        process_id.to_string(),
                        e.to_string(),
                    ))
                }
                Err(_) => warn!(
                    process_id,
                    "Process did not exit within {:?}, sending SIGKILL", timeout
                ),
            },
            Err(e) => warn!(process_id, "Graceful stop failed: {}", e),
        }
    }

    child
        .kill()
        .await
        .map_err(|e| AgentvisorError::StopError(process_id.to_string(), e.to_string()))?;
    let status = child
        .wait()
        .await
        .map_err(|e| AgentvisorError::StopError(process_id.to_string(), e.to_string()))?;

    Ok(status.code())
}

struct Shared {
    config: SupervisorConfig,
    registry: Mutex<ProcessRegistry>,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    /// Woken after every polling tick and every explicit state change
    changed: Notify,
    /// Serializes ticks from the loop and from direct `poll_once` calls
    poll_lock: Mutex<()>,
}

impl Shared {
    async fn poll_once(self: &Arc<Self>) {
        let _tick = self.poll_lock.lock().await;
        let mut alerts = Vec::new();

        let (due, pids) = {
            let mut registry = self.registry.lock().await;
            for (process_id, exit_code) in registry.collect_exits() {
                registry.apply_exit(&process_id, exit_code, &mut alerts);
            }
            let due = registry.take_due_restarts(Instant::now());
            (due, registry.live_pids())
        };

        for spec in due {
            self.restart(spec, &mut alerts).await;
        }

        let samples = {
            let mut sampler = self.sampler.lock().await;
            let raw: Vec<u32> = pids.iter().map(|(_, pid)| *pid).collect();
            sampler.refresh(&raw);
            pids.into_iter()
                .map(|(process_id, pid)| (process_id, sampler.sample(pid)))
                .collect::<Vec<_>>()
        };

        let enforcements = {
            let mut registry = self.registry.lock().await;
            let enforcements: Vec<LimitEnforcement> = samples
                .into_iter()
                .filter_map(|(process_id, usage)| {
                    registry.apply_sample(&process_id, usage, &mut alerts)
                })
                .collect();

            if registry.cleanup_due() {
                let reaped = registry.reap(Utc::now());
                if !reaped.is_empty() {
                    info!("Reaped {} terminal process entries", reaped.len());
                }
            }
            enforcements
        };

        for enforcement in enforcements {
            self.enforce(enforcement);
        }

        self.dispatch(alerts).await;
        self.changed.notify_waiters();
    }

    async fn restart(&self, spec: ProcessSpec, alerts: &mut Vec<Alert>) {
        let process_id = spec.process_id.clone();

        match spawn_process(&spec).await {
            Ok(spawned) => {
                let pid = spawned.pid;
                let installed = self.registry.lock().await.install(&process_id, spawned);
                match installed {
                    Ok(()) => info!(process_id = %process_id, pid, "Process restarted"),
                    Err(mut child) => {
                        debug!(process_id = %process_id, "Discarding restart of a stopped process");
                        if let Err(e) = child.kill().await {
                            warn!(process_id = %process_id, "Failed to kill discarded child: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                let outcome = self
                    .registry
                    .lock()
                    .await
                    .apply_restart_failure(&process_id, &e, alerts);
                if outcome == Some(ExitOutcome::Exhausted) {
                    error!(process_id = %process_id, "Giving up on process after failed restart");
                }
            }
        }
    }

    /// Limit stops run on their own task so a slow exit never holds up the tick
    fn enforce(self: &Arc<Self>, enforcement: LimitEnforcement) {
        match enforcement {
            LimitEnforcement::Restart { process_id, pid } => {
                info!(process_id = %process_id, "Killing process over its resource limit for restart");
                if let Err(e) = send_signal(pid, ProcessSignal::Kill) {
                    warn!(process_id = %process_id, "Limit restart failed: {}", e);
                }
            }
            LimitEnforcement::Stop { process_id } => {
                info!(process_id = %process_id, "Stopping process over its resource limit");
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = shared.stop(&process_id, false).await {
                        warn!(process_id = %process_id, "Limit stop failed: {}", e);
                    }
                });
            }
        }
    }

    async fn stop(&self, process_id: &str, cleanup_resources: bool) -> Result<ProcessStatus> {
        let (child, was_paused) = {
            let mut registry = self.registry.lock().await;
            let process = registry
                .get_mut(process_id)
                .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))?;

            if process.lifecycle_state.is_terminal() {
                let status = process.snapshot();
                if cleanup_resources {
                    registry.remove(process_id);
                }
                return Ok(status);
            }

            let was_paused = process.lifecycle_state == LifecycleState::Paused;
            process.stop_requested = true;
            process.restart_due = None;
            process.lifecycle_state = LifecycleState::Completing;
            (process.child.take(), was_paused)
        };

        let outcome = match child {
            Some(child) => {
                terminate_child(process_id, child, was_paused, self.config.stop_timeout()).await
            }
            None => Ok(None),
        };

        self.finish_stop(process_id, outcome, cleanup_resources).await
    }

    /// Leave COMPLETING: TERMINATED on a clean stop, FAILED when termination errored
    async fn finish_stop(
        &self,
        process_id: &str,
        outcome: Result<Option<i32>>,
        cleanup_resources: bool,
    ) -> Result<ProcessStatus> {
        let status = {
            let mut registry = self.registry.lock().await;
            let process = registry
                .get_mut(process_id)
                .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))?;
            match &outcome {
                Ok(exit_code) => {
                    process.exit_code = *exit_code;
                    process.mark_terminal(LifecycleState::Terminated);
                }
                Err(e) => {
                    error!(process_id, "Stop failed, marking process failed: {}", e);
                    process.mark_terminal(LifecycleState::Failed);
                }
            }
            let status = process.snapshot();
            if cleanup_resources && outcome.is_ok() {
                registry.remove(process_id);
            }
            status
        };
        self.changed.notify_waiters();

        let exit_code = outcome?;
        info!(process_id, ?exit_code, "Process monitoring stopped");
        Ok(status)
    }

    async fn dispatch(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() || self.sinks.is_empty() {
            return;
        }
        let timeout = self.config.sink_timeout();

        for alert in &alerts {
            let deliveries = self.sinks.iter().map(|sink| async move {
                match tokio::time::timeout(timeout, sink.send(alert)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(sink = sink.name(), "Alert delivery failed: {}", e),
                    Err(_) => warn!(sink = sink.name(), "Alert delivery timed out after {:?}", timeout),
                }
            });
            join_all(deliveries).await;
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Process supervisor: spawns processes, polls their resource usage and
/// drives restarts, alerts and reaping from a background loop
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ProcessSupervisor {
    /// Supervisor sampling through sysinfo and alerting through tracing
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::with_components(
            config,
            Box::new(SysinfoSampler::new()),
            vec![Arc::new(TracingAlertSink)],
        )
    }

    pub fn with_components(
        config: SupervisorConfig,
        sampler: Box<dyn ResourceSampler>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(ProcessRegistry::new(config.clone())),
                config,
                sampler: Mutex::new(sampler),
                sinks,
                changed: Notify::new(),
                poll_lock: Mutex::new(()),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Start the background polling loop. No-op when already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = shared.config.poll_interval();

        let handle = tokio::spawn(async move {
            info!("Process supervisor started (poll interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => shared.poll_once().await,
                }
            }
            info!("Process supervisor stopped");
        });

        *worker = Some(Worker { cancel, handle });
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Cancel the polling loop and wait for it up to `shutdown_timeout`.
    /// Monitored processes keep running; use `stop_all` to end them.
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        worker.cancel.cancel();

        let timeout = self.shared.config.shutdown_timeout();
        let abort = worker.handle.abort_handle();
        match tokio::time::timeout(timeout, worker.handle).await {
            Ok(Ok(())) => debug!("Polling loop joined"),
            Ok(Err(e)) => error!("Polling loop ended abnormally: {}", e),
            Err(_) => {
                warn!("Polling loop did not stop within {:?}, aborting", timeout);
                abort.abort();
            }
        }
    }

    /// Run a single polling tick
    pub async fn poll_once(&self) {
        self.shared.poll_once().await;
    }

    /// Register and spawn a process. Returns its PID.
    pub async fn monitor_process(&self, spec: ProcessSpec) -> Result<u32> {
        let process_id = spec.process_id.clone();
        self.shared.registry.lock().await.reserve(spec.clone())?;

        let spawned = match spawn_process(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.shared.registry.lock().await.release(&process_id);
                warn!(process_id = %process_id, "Spawn failed: {}", e);
                return Err(e);
            }
        };
        let pid = spawned.pid;

        let installed = self.shared.registry.lock().await.install(&process_id, spawned);
        if let Err(mut child) = installed {
            if let Err(e) = child.kill().await {
                warn!(process_id = %process_id, "Failed to kill orphaned child: {}", e);
            }
            return Err(AgentvisorError::InvalidProcessState(
                process_id,
                "stopped before spawn completed".to_string(),
            ));
        }

        info!(process_id = %process_id, pid, "Monitoring process");
        self.shared.changed.notify_waiters();
        Ok(pid)
    }

    /// Stop a process and mark it TERMINATED; drop the entry when `cleanup_resources`
    pub async fn stop_process_monitoring(
        &self,
        process_id: &str,
        cleanup_resources: bool,
    ) -> Result<ProcessStatus> {
        self.shared.stop(process_id, cleanup_resources).await
    }

    pub async fn pause_process(&self, process_id: &str) -> Result<()> {
        self.signal_transition(
            process_id,
            LifecycleState::Running,
            LifecycleState::Paused,
            ProcessSignal::Stop,
        )
        .await
    }

    pub async fn resume_process(&self, process_id: &str) -> Result<()> {
        self.signal_transition(
            process_id,
            LifecycleState::Paused,
            LifecycleState::Running,
            ProcessSignal::Continue,
        )
        .await
    }

    async fn signal_transition(
        &self,
        process_id: &str,
        from: LifecycleState,
        to: LifecycleState,
        signal: ProcessSignal,
    ) -> Result<()> {
        let pid = {
            let registry = self.shared.registry.lock().await;
            let process = registry
                .get(process_id)
                .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))?;
            if process.lifecycle_state != from {
                return Err(AgentvisorError::InvalidProcessState(
                    process_id.to_string(),
                    process.lifecycle_state.to_string(),
                ));
            }
            process.pid.ok_or_else(|| {
                AgentvisorError::InvalidProcessState(process_id.to_string(), "no pid".to_string())
            })?
        };

        send_signal(pid, signal)?;

        let mut registry = self.shared.registry.lock().await;
        if let Some(process) = registry.get_mut(process_id) {
            if process.lifecycle_state == from {
                process.lifecycle_state = to;
                info!(process_id, "Process {}", to);
            }
        }
        drop(registry);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    pub async fn get_status(&self, process_id: &str) -> Result<ProcessStatus> {
        self.shared
            .registry
            .lock()
            .await
            .get(process_id)
            .map(|p| p.snapshot())
            .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))
    }

    /// Retained resource samples, oldest first, at most `metrics_history_len`
    pub async fn get_metrics_history(&self, process_id: &str) -> Result<Vec<ResourceUsage>> {
        self.shared
            .registry
            .lock()
            .await
            .get(process_id)
            .map(|p| p.metrics_history.iter().cloned().collect())
            .ok_or_else(|| AgentvisorError::UnknownProcess(process_id.to_string()))
    }

    pub async fn list_processes(&self) -> Vec<ProcessStatus> {
        self.shared.registry.lock().await.statuses()
    }

    /// Wait until the process reaches a terminal state
    ///
    /// Driven by the polling loop when it runs; otherwise this call polls
    /// on its own at `poll_interval`.
    pub async fn wait_for_terminal(
        &self,
        process_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessStatus> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_until_terminal(process_id))
                .await
                .map_err(|_| {
                AgentvisorError::TimeoutError(format!(
                    "Process {} not terminal after {:?}",
                    process_id, limit
                ))
            })?,
            None => self.wait_until_terminal(process_id).await,
        }
    }

    async fn wait_until_terminal(&self, process_id: &str) -> Result<ProcessStatus> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.get_status(process_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }

            if self.is_running().await {
                notified.await;
            } else {
                self.poll_once().await;
                let status = self.get_status(process_id).await?;
                if status.is_terminal() {
                    return Ok(status);
                }
                tokio::time::sleep(self.shared.config.poll_interval()).await;
            }
        }
    }

    /// Mark every alert of the process as acknowledged; returns how many changed
    pub async fn acknowledge_alerts(&self, process_id: &str) -> Result<usize> {
        self.shared.registry.lock().await.acknowledge(process_id)
    }

    /// Reap entries terminal for longer than `reap_after`
    pub async fn cleanup_completed_processes(&self) -> Vec<String> {
        self.shared.registry.lock().await.reap(Utc::now())
    }

    pub async fn build_system_summary(&self) -> SystemSummary {
        self.shared.registry.lock().await.summary()
    }

    /// Stop every non-terminal process
    pub async fn stop_all(&self) -> Result<()> {
        let active: Vec<String> = self
            .list_processes()
            .await
            .into_iter()
            .filter(|status| !status.is_terminal())
            .map(|status| status.process_id)
            .collect();

        let results = join_all(
            active
                .iter()
                .map(|process_id| self.shared.stop(process_id, false)),
        )
        .await;

        let mut first_error = None;
        for (process_id, result) in active.iter().zip(results) {
            if let Err(e) = result {
                error!(process_id = %process_id, "Failed to stop process: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.try_lock() {
            if let Some(worker) = worker.take() {
                worker.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::alerts::AlertSeverity;
    use crate::process::types::{LimitAction, ResourceLimits};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FixedSampler {
        usage: Arc<StdMutex<Option<ResourceUsage>>>,
    }

    impl ResourceSampler for FixedSampler {
        fn refresh(&mut self, _pids: &[u32]) {}

        fn sample(&self, _pid: u32) -> Option<ResourceUsage> {
            self.usage.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        alerts: StdMutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for CollectingSink {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn send(&self, alert: &Alert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            Err(AgentvisorError::AlertSinkError(
                "failing".to_string(),
                "unreachable".to_string(),
            ))
        }
    }

    struct HangingSink;

    #[async_trait]
    impl AlertSink for HangingSink {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval_ms: 20,
            restart_delay_ms: 0,
            max_restart_attempts: 3,
            stop_timeout_secs: 2,
            sink_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn supervisor_with(
        usage: Option<ResourceUsage>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> (ProcessSupervisor, Arc<StdMutex<Option<ResourceUsage>>>) {
        let usage = Arc::new(StdMutex::new(usage));
        let sampler = FixedSampler {
            usage: Arc::clone(&usage),
        };
        (
            ProcessSupervisor::with_components(test_config(), Box::new(sampler), sinks).unwrap(),
            usage,
        )
    }

    #[tokio::test]
    async fn test_successful_process_completes() {
        let (supervisor, _) = supervisor_with(None, vec![]);

        let pid = supervisor
            .monitor_process(ProcessSpec::new("ok", ["/bin/true"]))
            .await
            .unwrap();
        assert!(pid > 0);

        let status = supervisor
            .wait_for_terminal("ok", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Completed);
        assert_eq!(status.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_failing_process_restarts_three_times() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor.start().await;

        supervisor
            .monitor_process(ProcessSpec::shell("flaky", "exit 1"))
            .await
            .unwrap();

        let status = supervisor
            .wait_for_terminal("flaky", Some(Duration::from_secs(15)))
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Failed);
        assert_eq!(status.restart_count, 3);
        assert!(status
            .alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = supervisor.get_status("flaky").await.unwrap();
        assert_eq!(status.restart_count, 3);
        assert_eq!(status.lifecycle_state, LifecycleState::Failed);

        supervisor.shutdown().await;
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_duplicate_process_id_rejected() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("dup", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        let result = supervisor
            .monitor_process(ProcessSpec::new("dup", ["/bin/sleep", "30"]))
            .await;
        assert!(matches!(result, Err(AgentvisorError::AlreadyMonitored(_))));

        supervisor.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_drops_reservation() {
        let (supervisor, _) = supervisor_with(None, vec![]);

        let result = supervisor
            .monitor_process(ProcessSpec::new("missing", ["/nonexistent/program"]))
            .await;

        assert!(matches!(result, Err(AgentvisorError::SpawnError(_))));
        assert!(supervisor.list_processes().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_log_dir_spawns_nothing() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let result = supervisor
            .monitor_process(ProcessSpec::new("logged", ["/bin/sleep", "30"]).log_dir(blocker.join("logs")))
            .await;

        assert!(matches!(result, Err(AgentvisorError::SpawnError(_))));
        assert!(supervisor.list_processes().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_marks_terminated_and_cleans_up() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("sleeper", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        let status = supervisor
            .stop_process_monitoring("sleeper", false)
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Terminated);
        assert!(supervisor.get_status("sleeper").await.is_ok());

        supervisor
            .stop_process_monitoring("sleeper", true)
            .await
            .unwrap();
        assert!(matches!(
            supervisor.get_status("sleeper").await,
            Err(AgentvisorError::UnknownProcess(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("pausable", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        supervisor.pause_process("pausable").await.unwrap();
        assert_eq!(
            supervisor.get_status("pausable").await.unwrap().lifecycle_state,
            LifecycleState::Paused
        );
        assert!(matches!(
            supervisor.pause_process("pausable").await,
            Err(AgentvisorError::InvalidProcessState(_, _))
        ));

        supervisor.resume_process("pausable").await.unwrap();
        assert_eq!(
            supervisor.get_status("pausable").await.unwrap().lifecycle_state,
            LifecycleState::Running
        );

        supervisor.pause_process("pausable").await.unwrap();
        let status = supervisor
            .stop_process_monitoring("pausable", false)
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_alerts_deduplicated_and_sinks_isolated() {
        let collecting = Arc::new(CollectingSink::default());
        let (supervisor, _) = supervisor_with(
            Some(ResourceUsage::new(90.0, 10.0)),
            vec![
                Arc::new(FailingSink),
                Arc::new(HangingSink),
                collecting.clone(),
            ],
        );
        supervisor
            .monitor_process(ProcessSpec::new("busy", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        for _ in 0..3 {
            supervisor.poll_once().await;
        }

        let delivered = collecting.alerts.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message, "CPU usage above threshold");

        let status = supervisor.get_status("busy").await.unwrap();
        assert_eq!(status.alerts.len(), 1);

        let summary = supervisor.build_system_summary().await;
        assert_eq!(summary.active_processes, 1);
        assert_eq!(
            summary.unacknowledged_alerts.get(&AlertSeverity::Warning),
            Some(&1)
        );
        assert_eq!(supervisor.acknowledge_alerts("busy").await.unwrap(), 1);

        supervisor.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_limit_action_stop() {
        let (supervisor, _) = supervisor_with(Some(ResourceUsage::new(1.0, 600.0)), vec![]);
        let limits = ResourceLimits::new(Some(512.0), None).with_action(LimitAction::Stop);
        supervisor
            .monitor_process(ProcessSpec::new("hog", ["/bin/sleep", "30"]).resource_limits(limits))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), supervisor.poll_once())
            .await
            .unwrap();
        supervisor.poll_once().await;

        let status = supervisor
            .wait_for_terminal("hog", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Terminated);
        assert!(status.limit_violation.as_deref().unwrap().starts_with("memory"));
        let limit_alerts = status
            .alerts
            .iter()
            .filter(|a| a.message == "Resource limit exceeded: memory")
            .count();
        assert_eq!(limit_alerts, 1);
    }

    #[tokio::test]
    async fn test_limit_stop_does_not_block_polling() {
        let config = SupervisorConfig {
            stop_timeout_secs: 5,
            ..test_config()
        };
        let usage = Arc::new(StdMutex::new(Some(ResourceUsage::new(1.0, 600.0))));
        let sampler = FixedSampler {
            usage: Arc::clone(&usage),
        };
        let supervisor =
            ProcessSupervisor::with_components(config, Box::new(sampler), vec![]).unwrap();
        let limits = ResourceLimits::new(Some(512.0), None).with_action(LimitAction::Stop);
        supervisor
            .monitor_process(
                ProcessSpec::shell("stubborn", "trap '' INT; sleep 30").resource_limits(limits),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        supervisor.poll_once().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let status = supervisor
            .wait_for_terminal("stubborn", Some(Duration::from_secs(15)))
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_failed_termination_marks_failed() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("stuck", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        let mut child = {
            let mut registry = supervisor.shared.registry.lock().await;
            let process = registry.get_mut("stuck").unwrap();
            process.stop_requested = true;
            process.lifecycle_state = LifecycleState::Completing;
            process.child.take().unwrap()
        };
        child.kill().await.unwrap();

        let result = supervisor
            .shared
            .finish_stop(
                "stuck",
                Err(AgentvisorError::StopError("stuck".to_string(), "wait failed".to_string())),
                true,
            )
            .await;
        assert!(matches!(result, Err(AgentvisorError::StopError(_, _))));

        let status = supervisor
            .wait_for_terminal("stuck", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Failed);
        assert!(status.terminal_at.is_some());
    }

    #[tokio::test]
    async fn test_metrics_history_capped() {
        let usage = Arc::new(StdMutex::new(Some(ResourceUsage::new(1.0, 10.0))));
        let sampler = FixedSampler {
            usage: Arc::clone(&usage),
        };
        let config = SupervisorConfig {
            metrics_history_len: 3,
            ..test_config()
        };
        let supervisor =
            ProcessSupervisor::with_components(config, Box::new(sampler), vec![]).unwrap();
        supervisor
            .monitor_process(ProcessSpec::new("sampled", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        for i in 0..5 {
            *usage.lock().unwrap() = Some(ResourceUsage::new(i as f64, 10.0));
            supervisor.poll_once().await;
        }

        let history = supervisor.get_metrics_history("sampled").await.unwrap();
        let cpu: Vec<f64> = history.iter().map(|u| u.cpu_percent).collect();
        assert_eq!(cpu, vec![2.0, 3.0, 4.0]);
        assert!(matches!(
            supervisor.get_metrics_history("nope").await,
            Err(AgentvisorError::UnknownProcess(_))
        ));

        supervisor.stop_all().await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SupervisorConfig {
            poll_interval_ms: 0,
            ..test_config()
        };
        assert!(matches!(
            ProcessSupervisor::new(config),
            Err(AgentvisorError::ConfigValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_terminal_entries() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("quick", ["/bin/true"]))
            .await
            .unwrap();
        supervisor
            .wait_for_terminal("quick", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(supervisor.cleanup_completed_processes().await.is_empty());
        assert_eq!(supervisor.list_processes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_terminal_times_out() {
        let (supervisor, _) = supervisor_with(None, vec![]);
        supervisor
            .monitor_process(ProcessSpec::new("long", ["/bin/sleep", "30"]))
            .await
            .unwrap();

        let result = supervisor
            .wait_for_terminal("long", Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(AgentvisorError::TimeoutError(_))));

        supervisor.stop_all().await.unwrap();
    }
}
