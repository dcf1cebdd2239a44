use crate::error::{AgentvisorError, Result};
use crate::reliability::WorkflowStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration covering all three components
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentvisorConfig {
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    pub reliability: ReliabilityConfig,
}

/// Process supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between polling loop ticks (in milliseconds)
    pub poll_interval_ms: u64,

    /// Whether failed processes are restarted automatically
    pub auto_restart: bool,

    /// Maximum number of restarts before a process settles in FAILED
    pub max_restart_attempts: u32,

    /// Initial delay before a restart (in milliseconds)
    pub restart_delay_ms: u64,

    /// Upper bound for the exponential restart backoff (in milliseconds)
    pub max_restart_delay_ms: u64,

    /// Use exponential backoff instead of a fixed restart delay
    pub exponential_backoff: bool,

    /// Time to wait after SIGINT before sending SIGKILL (in seconds)
    pub stop_timeout_secs: u64,

    /// Window in which identical alerts are collapsed (in seconds)
    pub alert_dedup_window_secs: u64,

    /// Terminal processes older than this are reaped (in seconds)
    pub reap_after_secs: u64,

    /// How often the polling loop runs the reaper (in seconds)
    pub cleanup_interval_secs: u64,

    /// Number of resource samples kept per process
    pub metrics_history_len: usize,

    /// How long shutdown waits for the polling loop (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Per-sink dispatch timeout (in milliseconds)
    pub sink_timeout_ms: u64,

    /// Fraction of a threshold at which health turns WARNING
    pub warning_ratio: f64,

    /// Multiple of a threshold at which health turns CRITICAL
    pub critical_ratio: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay_ms: 1000,
            max_restart_delay_ms: 60_000,
            exponential_backoff: true,
            stop_timeout_secs: 10,
            alert_dedup_window_secs: 300,
            reap_after_secs: 3600,
            cleanup_interval_secs: 300,
            metrics_history_len: 120,
            shutdown_timeout_secs: 5,
            sink_timeout_ms: 2000,
            warning_ratio: 0.8,
            critical_ratio: 1.2,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn alert_dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_window_secs)
    }

    pub fn reap_after(&self) -> Duration {
        Duration::from_secs(self.reap_after_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    /// Validate the supervisor section
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(AgentvisorError::ConfigValidationError(
                "supervisor.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        if self.metrics_history_len == 0 {
            return Err(AgentvisorError::ConfigValidationError(
                "supervisor.metrics_history_len must be at least 1".to_string(),
            ));
        }

        if !(self.warning_ratio > 0.0 && self.warning_ratio <= 1.0) {
            return Err(AgentvisorError::ConfigValidationError(format!(
                "supervisor.warning_ratio must be in (0, 1], got {}",
                self.warning_ratio
            )));
        }

        if self.critical_ratio < 1.0 {
            return Err(AgentvisorError::ConfigValidationError(format!(
                "supervisor.critical_ratio must be at least 1.0, got {}",
                self.critical_ratio
            )));
        }

        if self.max_restart_delay_ms < self.restart_delay_ms {
            return Err(AgentvisorError::ConfigValidationError(
                "supervisor.max_restart_delay_ms cannot be lower than restart_delay_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Dependency scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Initial bound on concurrently running tasks within a batch
    pub max_parallelism: usize,

    /// Floor for adaptive parallelism reduction
    pub min_parallelism: usize,

    /// Batches succeeding below this rate reduce parallelism
    pub batch_success_threshold: f64,

    /// Keep scheduling independent tasks after a task exhausts its retries
    pub continue_on_failure: bool,

    /// Overall success rate required before a new pattern is learned
    pub learning_success_threshold: f64,

    /// Duration-prediction accuracy required before a new pattern is learned
    pub learning_accuracy_threshold: f64,

    /// Fraction of subtask descriptions a keyword must appear in
    pub keyword_frequency_threshold: f64,

    /// Weight of the previous value in pattern moving averages
    pub ema_weight: f64,

    /// Minimum score for a pattern to count as a match
    pub pattern_match_threshold: f64,

    /// Number of matches returned by pattern lookup
    pub max_matching_patterns: usize,

    /// Optional cap on learned patterns; least recently used are evicted
    pub max_patterns: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            min_parallelism: 2,
            batch_success_threshold: 0.7,
            continue_on_failure: false,
            learning_success_threshold: 0.8,
            learning_accuracy_threshold: 0.7,
            keyword_frequency_threshold: 0.3,
            ema_weight: 0.8,
            pattern_match_threshold: 0.4,
            max_matching_patterns: 3,
            max_patterns: None,
        }
    }
}

impl SchedulerConfig {
    /// Validate the scheduler section
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(AgentvisorError::ConfigValidationError(
                "scheduler.max_parallelism must be at least 1".to_string(),
            ));
        }

        if self.min_parallelism == 0 {
            return Err(AgentvisorError::ConfigValidationError(
                "scheduler.min_parallelism must be at least 1".to_string(),
            ));
        }

        let fractions = [
            ("batch_success_threshold", self.batch_success_threshold),
            ("learning_success_threshold", self.learning_success_threshold),
            ("learning_accuracy_threshold", self.learning_accuracy_threshold),
            ("keyword_frequency_threshold", self.keyword_frequency_threshold),
            ("ema_weight", self.ema_weight),
            ("pattern_match_threshold", self.pattern_match_threshold),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentvisorError::ConfigValidationError(format!(
                    "scheduler.{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        if self.max_patterns == Some(0) {
            return Err(AgentvisorError::ConfigValidationError(
                "scheduler.max_patterns must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Warning and critical percentages for host resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 95.0,
            memory_warning_percent: 80.0,
            memory_critical_percent: 95.0,
            disk_warning_percent: 85.0,
            disk_critical_percent: 95.0,
        }
    }
}

/// Reliability manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Fraction of a stage timeout after which warnings are raised
    pub warning_fraction: f64,

    /// Per-stage hard timeout overrides keyed by stage name (in milliseconds)
    pub stage_timeouts_ms: HashMap<String, u64>,

    /// Bound on a whole health check (in milliseconds)
    pub health_check_timeout_ms: u64,

    /// Bound on a single dependency probe (in milliseconds)
    pub probe_timeout_ms: u64,

    pub thresholds: HealthThresholds,

    /// Recoverable errors handled per workflow before giving up
    pub max_recovery_attempts: u32,

    /// Delay applied before retrying a stage after a transient error (in milliseconds)
    pub retry_delay_ms: u64,

    /// Write a final snapshot when monitoring stops
    pub persist_on_stop: bool,

    /// Number of health checks retained per workflow
    pub recent_health_checks: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            warning_fraction: 0.4,
            stage_timeouts_ms: HashMap::new(),
            health_check_timeout_ms: 5000,
            probe_timeout_ms: 2000,
            thresholds: HealthThresholds::default(),
            max_recovery_attempts: 3,
            retry_delay_ms: 1000,
            persist_on_stop: true,
            recent_health_checks: 10,
        }
    }
}

impl ReliabilityConfig {
    /// Hard timeout for a stage, honouring overrides
    pub fn stage_timeout(&self, stage: WorkflowStage) -> Duration {
        self.stage_timeouts_ms
            .get(stage.as_str())
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| stage.default_timeout())
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate the reliability section
    pub fn validate(&self) -> Result<()> {
        if !(self.warning_fraction > 0.0 && self.warning_fraction < 1.0) {
            return Err(AgentvisorError::ConfigValidationError(format!(
                "reliability.warning_fraction must be in (0, 1), got {}",
                self.warning_fraction
            )));
        }

        for (name, timeout) in &self.stage_timeouts_ms {
            if WorkflowStage::parse(name).is_none() {
                return Err(AgentvisorError::ConfigValidationError(format!(
                    "Unknown stage in reliability.stage_timeouts_ms: {}",
                    name
                )));
            }
            if *timeout == 0 {
                return Err(AgentvisorError::ConfigValidationError(format!(
                    "Timeout for stage {} must be at least 1ms",
                    name
                )));
            }
        }

        let t = &self.thresholds;
        let pairs = [
            ("cpu", t.cpu_warning_percent, t.cpu_critical_percent),
            ("memory", t.memory_warning_percent, t.memory_critical_percent),
            ("disk", t.disk_warning_percent, t.disk_critical_percent),
        ];
        for (name, warning, critical) in pairs {
            if warning >= critical {
                return Err(AgentvisorError::ConfigValidationError(format!(
                    "{} warning threshold ({}) must be below critical threshold ({})",
                    name, warning, critical
                )));
            }
        }

        if self.recent_health_checks == 0 {
            return Err(AgentvisorError::ConfigValidationError(
                "reliability.recent_health_checks must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl AgentvisorConfig {
    /// Load configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentvisorError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(AgentvisorError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML configuration
    pub fn parse_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| AgentvisorError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    /// Parse JSON configuration
    pub fn parse_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| AgentvisorError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()?;
        self.scheduler.validate()?;
        self.reliability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentvisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor.max_restart_attempts, 3);
        assert_eq!(config.supervisor.alert_dedup_window_secs, 300);
        assert_eq!(config.supervisor.reap_after_secs, 3600);
        assert_eq!(config.scheduler.min_parallelism, 2);
        assert_eq!(config.reliability.warning_fraction, 0.4);
    }

    #[test]
    fn test_load_toml_with_partial_sections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agentvisor.toml");
        fs::write(
            &path,
            r#"
[supervisor]
poll_interval_ms = 250
max_restart_attempts = 5

[scheduler]
max_parallelism = 8

[reliability.stage_timeouts_ms]
implementation = 90000
"#,
        )
        .unwrap();

        let config = AgentvisorConfig::from_file(&path).unwrap();
        assert_eq!(config.supervisor.poll_interval_ms, 250);
        assert_eq!(config.supervisor.max_restart_attempts, 5);
        assert!(config.supervisor.auto_restart);
        assert_eq!(config.scheduler.max_parallelism, 8);
        assert_eq!(
            config.reliability.stage_timeout(WorkflowStage::Implementation),
            Duration::from_millis(90_000)
        );
        assert_eq!(
            config.reliability.stage_timeout(WorkflowStage::Testing),
            WorkflowStage::Testing.default_timeout()
        );
    }

    #[test]
    fn test_load_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agentvisor.json");
        fs::write(
            &path,
            r#"{"scheduler": {"continue_on_failure": true, "max_patterns": 50}}"#,
        )
        .unwrap();

        let config = AgentvisorConfig::from_file(&path).unwrap();
        assert!(config.scheduler.continue_on_failure);
        assert_eq!(config.scheduler.max_patterns, Some(50));
    }

    #[test]
    fn test_retired_scheduler_keys_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agentvisor.toml");
        fs::write(
            &path,
            r#"
[scheduler]
max_parallelism = 3
task_poll_interval_ms = 50
"#,
        )
        .unwrap();

        let config = AgentvisorConfig::from_file(&path).unwrap();
        assert_eq!(
            config.scheduler,
            SchedulerConfig {
                max_parallelism: 3,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agentvisor.yaml");
        fs::write(&path, "supervisor: {}").unwrap();

        assert!(matches!(
            AgentvisorConfig::from_file(&path),
            Err(AgentvisorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_stage_override_rejected() {
        let mut config = AgentvisorConfig::default();
        config
            .reliability
            .stage_timeouts_ms
            .insert("deployment".to_string(), 1000);

        assert!(matches!(
            config.validate(),
            Err(AgentvisorError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = AgentvisorConfig::default();
        config.reliability.thresholds.cpu_warning_percent = 99.0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut config = AgentvisorConfig::default();
        config.scheduler.max_parallelism = 0;

        assert!(matches!(
            config.validate(),
            Err(AgentvisorError::ConfigValidationError(_))
        ));
    }
}
