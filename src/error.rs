use thiserror::Error;

/// Main error type for the agentvisor scheduler, supervisor and reliability manager
#[derive(Debug, Error)]
pub enum AgentvisorError {
    // Task graph errors
    #[error("Dependency cycle detected among tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task {0} failed: {1}")]
    TaskFailed(String, String),

    #[error("Execution cancelled")]
    Cancelled,

    // Process-related errors
    #[error("Process already monitored: {0}")]
    AlreadyMonitored(String),

    #[error("Unknown process: {0}")]
    UnknownProcess(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Process {0} is in invalid state for this operation: {1}")]
    InvalidProcessState(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("Resource limit exceeded for process {0}: {1}")]
    ResourceExceeded(String, String),

    // Workflow errors
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow already monitored: {0}")]
    WorkflowAlreadyMonitored(String),

    #[error("Stage timeout detected for workflow {workflow_id} in stage {stage}")]
    TimeoutDetected { workflow_id: String, stage: String },

    #[error("Recovery attempts exhausted for {0}: {1}")]
    RecoveryExhausted(String, String),

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    // State store errors
    #[error("State store error: {0}")]
    StateError(String),

    #[error("Invalid state key: {0}")]
    InvalidKey(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // Alerting
    #[error("Alert sink {0} failed: {1}")]
    AlertSinkError(String, String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for agentvisor operations
pub type Result<T> = std::result::Result<T, AgentvisorError>;
