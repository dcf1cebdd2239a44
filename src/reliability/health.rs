use crate::config::HealthThresholds;
use crate::error::{AgentvisorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealthStatus {
    Healthy,
    Warning,
    Critical,
    /// A required dependency is unreachable
    Failed,
}

impl std::fmt::Display for SystemHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemHealthStatus::Healthy => write!(f, "healthy"),
            SystemHealthStatus::Warning => write!(f, "warning"),
            SystemHealthStatus::Critical => write!(f, "critical"),
            SystemHealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Host-wide resource percentages
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HostUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Host resource introspection used by health checks
pub trait SystemSampler: Send {
    fn sample(&mut self) -> HostUsage;
}

/// sysinfo-backed host sampler
///
/// CPU usage is computed between consecutive calls, so the first sample of a
/// fresh sampler may read 0.
pub struct SysinfoSystemSampler {
    system: System,
    disks: Disks,
}

impl SysinfoSystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoSystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSystemSampler {
    fn sample(&mut self) -> HostUsage {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh_list();

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        };

        let (total, available) = self
            .disks
            .list()
            .iter()
            .fold((0_u64, 0_u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk_percent = if total == 0 {
            0.0
        } else {
            (total - available.min(total)) as f64 / total as f64 * 100.0
        };

        HostUsage {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            memory_percent,
            disk_percent,
        }
    }
}

/// External dependency checked during health checks
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// An unreachable required dependency fails the whole check
    fn required(&self) -> bool;

    async fn check(&self) -> Result<()>;
}

/// Probe that runs a command-line tool and expects a successful exit
pub struct CommandProbe {
    name: String,
    program: String,
    args: Vec<String>,
    required: bool,
}

impl CommandProbe {
    /// Probe `<program> --version`
    pub fn new(program: impl Into<String>, required: bool) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args: vec!["--version".to_string()],
            required,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn required(&self) -> bool {
        self.required
    }

    async fn check(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| AgentvisorError::Internal(format!("{}: {}", self.program, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(AgentvisorError::Internal(format!(
                "{} exited with {}",
                self.program, status
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub required: bool,
    pub reachable: bool,
    /// Time the probe took, up to the probe timeout
    pub latency_ms: u64,
    pub detail: Option<String>,
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthCheck {
    pub status: SystemHealthStatus,
    pub usage: HostUsage,
    pub dependencies: Vec<DependencyStatus>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SystemHealthCheck {
    /// Check that could not complete within its time bound
    pub fn timed_out(limit: Duration) -> Self {
        Self {
            status: SystemHealthStatus::Critical,
            usage: HostUsage::default(),
            dependencies: Vec::new(),
            recommendations: vec![format!(
                "Health check did not complete within {:?}; the host may be overloaded",
                limit
            )],
            timestamp: Utc::now(),
            duration_ms: limit.as_millis() as u64,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == SystemHealthStatus::Healthy
    }
}

/// Classify a sample plus dependency results, producing recommendations for
/// every non-healthy condition
pub fn classify(
    usage: &HostUsage,
    dependencies: &[DependencyStatus],
    thresholds: &HealthThresholds,
) -> (SystemHealthStatus, Vec<String>) {
    let mut status = SystemHealthStatus::Healthy;
    let mut recommendations = Vec::new();

    let resources = [
        (
            "CPU",
            usage.cpu_percent,
            thresholds.cpu_warning_percent,
            thresholds.cpu_critical_percent,
            "reduce parallelism or pause non-critical processes",
        ),
        (
            "Memory",
            usage.memory_percent,
            thresholds.memory_warning_percent,
            thresholds.memory_critical_percent,
            "stop idle processes or lower per-process memory limits",
        ),
        (
            "Disk",
            usage.disk_percent,
            thresholds.disk_warning_percent,
            thresholds.disk_critical_percent,
            "free disk space before writing further checkpoints",
        ),
    ];

    for (label, value, warning, critical, advice) in resources {
        if value >= critical {
            status = status.max(SystemHealthStatus::Critical);
            recommendations.push(format!(
                "{} usage at {:.1}% exceeds critical threshold {:.0}%: {}",
                label, value, critical, advice
            ));
        } else if value >= warning {
            status = status.max(SystemHealthStatus::Warning);
            recommendations.push(format!(
                "{} usage at {:.1}% exceeds warning threshold {:.0}%: {}",
                label, value, warning, advice
            ));
        }
    }

    for dependency in dependencies.iter().filter(|d| !d.reachable) {
        if dependency.required {
            status = status.max(SystemHealthStatus::Failed);
            recommendations.push(format!(
                "Required dependency {} is unreachable; restore it before continuing",
                dependency.name
            ));
        } else {
            status = status.max(SystemHealthStatus::Warning);
            recommendations.push(format!(
                "Optional dependency {} is unreachable; related features are degraded",
                dependency.name
            ));
        }
    }

    (status, recommendations)
}

/// Runs the host sampler and every probe
pub struct HealthChecker {
    sampler: Mutex<Box<dyn SystemSampler>>,
    probes: Vec<Arc<dyn HealthProbe>>,
    thresholds: HealthThresholds,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        sampler: Box<dyn SystemSampler>,
        probes: Vec<Arc<dyn HealthProbe>>,
        thresholds: HealthThresholds,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            sampler: Mutex::new(sampler),
            probes,
            thresholds,
            probe_timeout,
        }
    }

    pub async fn run(&self) -> SystemHealthCheck {
        let started = Instant::now();
        let usage = self.sampler.lock().await.sample();

        let dependencies = join_all(self.probes.iter().map(|probe| self.probe(probe))).await;
        let (status, recommendations) = classify(&usage, &dependencies, &self.thresholds);

        debug!(%status, ?usage, "Health check finished");

        SystemHealthCheck {
            status,
            usage,
            dependencies,
            recommendations,
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn probe(&self, probe: &Arc<dyn HealthProbe>) -> DependencyStatus {
        let started = Instant::now();
        let (reachable, detail) = match tokio::time::timeout(self.probe_timeout, probe.check()).await
        {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (
                false,
                Some(format!("no response within {:?}", self.probe_timeout)),
            ),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        if !reachable {
            warn!(
                dependency = probe.name(),
                required = probe.required(),
                latency_ms,
                "Dependency unreachable"
            );
        }

        DependencyStatus {
            name: probe.name().to_string(),
            required: probe.required(),
            reachable,
            latency_ms,
            detail,
        }
    }
}
