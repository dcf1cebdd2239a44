// Process module - supervised child processes, resource sampling and alerts

pub mod alerts;
mod manager;
pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use alerts::{Alert, AlertSeverity, AlertSink, AlertType, FileAlertSink, TracingAlertSink};
pub use manager::SystemSummary;
pub use monitor::{ResourceSampler, SysinfoSampler};
pub use restart::{BackoffStrategy, RestartPolicy, RestartTracker};
pub use spawner::{spawn_process, SpawnedProcess, PROCESS_ID_ENV, TASK_ID_ENV};
pub use supervisor::ProcessSupervisor;
pub use types::{
    AlertThresholds, HealthState, LifecycleState, LimitAction, LimitViolation, ProcessSpec,
    ProcessStatus, ResourceLimits, ResourceUsage,
};
