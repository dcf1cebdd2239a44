use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered workflow stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Initialization,
    RequirementsAnalysis,
    TaskDecomposition,
    Implementation,
    Testing,
    Validation,
    Integration,
    FinalCleanup,
}

impl WorkflowStage {
    pub const ALL: [WorkflowStage; 8] = [
        WorkflowStage::Initialization,
        WorkflowStage::RequirementsAnalysis,
        WorkflowStage::TaskDecomposition,
        WorkflowStage::Implementation,
        WorkflowStage::Testing,
        WorkflowStage::Validation,
        WorkflowStage::Integration,
        WorkflowStage::FinalCleanup,
    ];

    pub fn first() -> Self {
        WorkflowStage::Initialization
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Initialization => "initialization",
            WorkflowStage::RequirementsAnalysis => "requirements_analysis",
            WorkflowStage::TaskDecomposition => "task_decomposition",
            WorkflowStage::Implementation => "implementation",
            WorkflowStage::Testing => "testing",
            WorkflowStage::Validation => "validation",
            WorkflowStage::Integration => "integration",
            WorkflowStage::FinalCleanup => "final_cleanup",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == name)
    }

    /// Hard timeout used when the configuration has no override
    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            WorkflowStage::Initialization => 60,
            WorkflowStage::RequirementsAnalysis => 300,
            WorkflowStage::TaskDecomposition => 300,
            WorkflowStage::Implementation => 1800,
            WorkflowStage::Testing => 900,
            WorkflowStage::Validation => 600,
            WorkflowStage::Integration => 600,
            WorkflowStage::FinalCleanup => 120,
        };
        Duration::from_secs(secs)
    }

    /// Leaving one of these stages writes a checkpoint
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            WorkflowStage::TaskDecomposition
                | WorkflowStage::Implementation
                | WorkflowStage::Testing
                | WorkflowStage::Integration
        )
    }

    pub fn next(&self) -> Option<Self> {
        let index = Self::ALL.iter().position(|stage| stage == self)?;
        Self::ALL.get(index + 1).copied()
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(WorkflowStage::first(), WorkflowStage::Initialization);
        assert_eq!(
            WorkflowStage::Implementation.next(),
            Some(WorkflowStage::Testing)
        );
        assert_eq!(WorkflowStage::FinalCleanup.next(), None);
        assert!(WorkflowStage::Initialization < WorkflowStage::FinalCleanup);
    }

    #[test]
    fn test_parse_matches_serde_names() {
        for stage in WorkflowStage::ALL {
            assert_eq!(WorkflowStage::parse(stage.as_str()), Some(stage));
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
        assert_eq!(WorkflowStage::parse("deployment"), None);
    }

    #[test]
    fn test_critical_stages() {
        let critical: Vec<_> = WorkflowStage::ALL
            .into_iter()
            .filter(WorkflowStage::is_critical)
            .collect();
        assert_eq!(
            critical,
            vec![
                WorkflowStage::TaskDecomposition,
                WorkflowStage::Implementation,
                WorkflowStage::Testing,
                WorkflowStage::Integration,
            ]
        );
    }
}
