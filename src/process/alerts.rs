use crate::error::{AgentvisorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Resource,
    Performance,
    Process,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// Stable description; the measured value lives in `current_value`
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
    pub process_id: String,
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(
        process_id: impl Into<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        threshold: f64,
        current_value: f64,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            alert_type,
            severity,
            message: message.into(),
            threshold,
            current_value,
            timestamp: Utc::now(),
            process_id: process_id.into(),
            acknowledged: false,
        }
    }

    /// Same type and message for the same process within `window`
    pub fn duplicates(&self, other: &Alert, window: Duration) -> bool {
        if self.process_id != other.process_id
            || self.alert_type != other.alert_type
            || self.message != other.message
        {
            return false;
        }

        let gap = if self.timestamp >= other.timestamp {
            self.timestamp - other.timestamp
        } else {
            other.timestamp - self.timestamp
        };
        gap.to_std().map(|gap| gap < window).unwrap_or(false)
    }
}

/// Append `alert` unless an equivalent one was recorded within `window`.
/// Returns whether the alert was stored.
pub fn record_alert(alerts: &mut Vec<Alert>, alert: Alert, window: Duration) -> bool {
    if alerts.iter().any(|existing| existing.duplicates(&alert, window)) {
        return false;
    }
    alerts.push(alert);
    true
}

/// Destination for alerts raised by the polling loop
///
/// Failures are logged by the supervisor and never stop polling or the
/// remaining sinks.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Sink that forwards alerts to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                process_id = %alert.process_id,
                alert_type = ?alert.alert_type,
                threshold = alert.threshold,
                current_value = alert.current_value,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                process_id = %alert.process_id,
                alert_type = ?alert.alert_type,
                threshold = alert.threshold,
                current_value = alert.current_value,
                "{}",
                alert.message
            ),
            AlertSeverity::Info => info!(
                process_id = %alert.process_id,
                alert_type = ?alert.alert_type,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Sink appending one JSON document per line to a file
pub struct FileAlertSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAlertSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AlertSink for FileAlertSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let mut line = serde_json::to_vec(alert)
            .map_err(|e| AgentvisorError::SerializationError(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AgentvisorError::AlertSinkError(self.name().to_string(), e.to_string()))?;

        file.write_all(&line)
            .await
            .map_err(|e| AgentvisorError::AlertSinkError(self.name().to_string(), e.to_string()))?;
        file.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cpu_alert(process_id: &str) -> Alert {
        Alert::new(
            process_id,
            AlertType::Resource,
            AlertSeverity::Warning,
            "CPU usage above threshold",
            80.0,
            91.5,
        )
    }

    #[test]
    fn test_duplicate_alerts_collapse() {
        let window = Duration::from_secs(300);
        let mut alerts = Vec::new();

        assert!(record_alert(&mut alerts, cpu_alert("p1"), window));

        let mut second = cpu_alert("p1");
        second.current_value = 99.0;
        assert!(!record_alert(&mut alerts, second, window));

        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_alerts_outside_window_are_kept() {
        let window = Duration::from_secs(300);
        let mut alerts = Vec::new();

        let mut old = cpu_alert("p1");
        old.timestamp = Utc::now() - chrono::Duration::minutes(6);
        assert!(record_alert(&mut alerts, old, window));
        assert!(record_alert(&mut alerts, cpu_alert("p1"), window));

        assert_eq!(alerts.len(), 2);
    }

    #[test]
    fn test_different_message_or_process_not_duplicate() {
        let window = Duration::from_secs(300);
        let mut alerts = Vec::new();

        record_alert(&mut alerts, cpu_alert("p1"), window);
        assert!(record_alert(&mut alerts, cpu_alert("p2"), window));

        let mut memory = cpu_alert("p1");
        memory.message = "Memory usage above threshold".to_string();
        assert!(record_alert(&mut alerts, memory, window));

        assert_eq!(alerts.len(), 3);
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileAlertSink::new(temp_dir.path().join("alerts").join("alerts.jsonl"));

        sink.send(&cpu_alert("p1")).await.unwrap();
        sink.send(&cpu_alert("p2")).await.unwrap();

        let contents = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let parsed: Vec<Alert> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].process_id, "p1");
        assert_eq!(parsed[1].process_id, "p2");
    }

    #[tokio::test]
    async fn test_tracing_sink_never_fails() {
        let sink = TracingAlertSink;
        assert!(sink.send(&cpu_alert("p1")).await.is_ok());
    }
}
