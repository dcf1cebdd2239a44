// Reliability module - workflow stage tracking, health checks, error recovery and checkpoints

pub mod checkpoint;
pub mod health;
pub mod manager;
pub mod recovery;
pub mod stages;

pub use checkpoint::Checkpoint;
pub use health::{
    CommandProbe, DependencyStatus, HealthChecker, HealthProbe, HostUsage, SysinfoSystemSampler,
    SystemHealthCheck, SystemHealthStatus, SystemSampler,
};
pub use manager::{
    ReliabilityManager, StageRecord, TimeoutStatus, WorkflowDiagnostics, WorkflowMonitoringState,
    WorkflowOutcome,
};
pub use recovery::{ErrorClass, ErrorHandlingOutcome, RecoveryAction};
pub use stages::WorkflowStage;
