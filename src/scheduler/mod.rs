// Scheduler module - task graphs, batch planning, adaptive execution and learned patterns

pub mod classifier;
pub mod executor;
pub mod graph;
pub mod patterns;

pub use classifier::{extract_keywords, KeywordClassifier, TaskClassifier};
pub use executor::{
    BatchReport, DependencyScheduler, ExecutionReport, ProcessTaskRunner, TaskResult, TaskRunner,
};
pub use graph::{compute_batches, ExecutionPlan, TaskNode, TaskStatus};
pub use patterns::{
    prediction_accuracy, LearningOutcome, Pattern, PatternLibrary, PatternMatch, SubtaskTemplate,
};
