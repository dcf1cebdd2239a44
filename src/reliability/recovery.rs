use crate::error::AgentvisorError;
use crate::reliability::stages::WorkflowStage;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;

/// Coarse classification routing an error to its recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientInfrastructure,
    Timeout,
    ResourceExhaustion,
    Configuration,
    Logic,
}

impl ErrorClass {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientInfrastructure
                | ErrorClass::Timeout
                | ErrorClass::ResourceExhaustion
        )
    }

    pub fn classify(error: &AgentvisorError) -> Self {
        match error {
            AgentvisorError::TimeoutError(_) | AgentvisorError::TimeoutDetected { .. } => {
                ErrorClass::Timeout
            }
            AgentvisorError::ResourceExceeded(_, _) => ErrorClass::ResourceExhaustion,
            AgentvisorError::Io(e) => match e.kind() {
                ErrorKind::TimedOut => ErrorClass::Timeout,
                ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
                    ErrorClass::Configuration
                }
                ErrorKind::OutOfMemory => ErrorClass::ResourceExhaustion,
                _ => ErrorClass::TransientInfrastructure,
            },
            AgentvisorError::SpawnError(_)
            | AgentvisorError::StopError(_, _)
            | AgentvisorError::SignalError(_)
            | AgentvisorError::StateError(_)
            | AgentvisorError::AlertSinkError(_, _) => ErrorClass::TransientInfrastructure,
            AgentvisorError::ConfigError(_)
            | AgentvisorError::InvalidConfig(_)
            | AgentvisorError::ConfigValidationError(_)
            | AgentvisorError::InvalidKey(_) => ErrorClass::Configuration,
            AgentvisorError::TaskFailed(_, message)
            | AgentvisorError::StageFailed { message, .. }
            | AgentvisorError::Internal(message) => Self::classify_message(message),
            _ => ErrorClass::Logic,
        }
    }

    /// Keyword fallback for errors that only carry a message
    pub fn classify_message(message: &str) -> Self {
        let message = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if has(&["timed out", "timeout", "deadline"]) {
            ErrorClass::Timeout
        } else if has(&["out of memory", "oom-kill", "no space", "resource", "too many open files"]) {
            ErrorClass::ResourceExhaustion
        } else if has(&[
            "connection",
            "network",
            "temporarily",
            "unavailable",
            "rate limit",
            "broken pipe",
        ]) {
            ErrorClass::TransientInfrastructure
        } else if has(&["config", "not found", "permission", "missing", "invalid setting"]) {
            ErrorClass::Configuration
        } else {
            ErrorClass::Logic
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransientInfrastructure => write!(f, "transient_infrastructure"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::ResourceExhaustion => write!(f, "resource_exhaustion"),
            ErrorClass::Configuration => write!(f, "configuration"),
            ErrorClass::Logic => write!(f, "logic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecoveryAction {
    /// Retry the failed stage after waiting
    RetryAfter { delay_ms: u64 },
    CreateCheckpoint,
    ReduceParallelism,
    RunHealthCheck,
    /// Give up on the stage and surface the error
    Abort,
}

impl RecoveryAction {
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            RecoveryAction::RetryAfter { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingOutcome {
    /// Whether a retry is worthwhile
    pub success: bool,
    pub error_class: ErrorClass,
    pub stage: WorkflowStage,
    pub recovery_actions: Vec<RecoveryAction>,
    pub recommendations: Vec<String>,
    pub recovery_attempt: u32,
}

impl ErrorHandlingOutcome {
    pub fn retry_delay(&self) -> Option<Duration> {
        self.recovery_actions
            .iter()
            .find_map(RecoveryAction::retry_delay)
    }
}

/// Recovery plan for an error class, before attempt accounting
pub(crate) fn recovery_plan(
    class: ErrorClass,
    stage: WorkflowStage,
    retry_delay: Duration,
) -> (Vec<RecoveryAction>, Vec<String>) {
    let delay_ms = retry_delay.as_millis() as u64;

    match class {
        ErrorClass::TransientInfrastructure => (
            vec![RecoveryAction::RetryAfter { delay_ms }],
            vec![format!(
                "Transient failure during {}; retrying after {}ms",
                stage, delay_ms
            )],
        ),
        ErrorClass::Timeout => (
            vec![
                RecoveryAction::CreateCheckpoint,
                RecoveryAction::RetryAfter { delay_ms },
            ],
            vec![
                format!("Stage {} timed out; progress checkpointed", stage),
                format!(
                    "Consider raising the {} timeout or splitting the stage",
                    stage
                ),
            ],
        ),
        ErrorClass::ResourceExhaustion => (
            vec![
                RecoveryAction::ReduceParallelism,
                RecoveryAction::RunHealthCheck,
                RecoveryAction::RetryAfter {
                    delay_ms: delay_ms.saturating_mul(2),
                },
            ],
            vec![
                "Host resources exhausted; reduce parallelism before retrying".to_string(),
                "Free memory or disk space held by finished processes".to_string(),
            ],
        ),
        ErrorClass::Configuration => (
            vec![RecoveryAction::Abort],
            vec![format!(
                "Configuration problem during {}; fix the configuration and rerun",
                stage
            )],
        ),
        ErrorClass::Logic => (
            vec![RecoveryAction::Abort],
            vec![format!(
                "Stage {} failed on its own logic; inspect the task output",
                stage
            )],
        ),
    }
}
