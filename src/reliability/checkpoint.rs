use crate::error::{AgentvisorError, Result};
use crate::reliability::stages::WorkflowStage;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CHECKPOINT_PREFIX: &str = "checkpoints";

/// Durable snapshot of workflow progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub workflow_id: String,
    pub stage: WorkflowStage,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Millisecond sequence used in the store key; strictly increasing per workflow
    pub sequence: i64,
}

impl Checkpoint {
    pub fn new(
        workflow_id: impl Into<String>,
        stage: WorkflowStage,
        context: serde_json::Value,
        sequence: i64,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            stage,
            context,
            timestamp: Utc::now(),
            sequence,
        }
    }

    /// `checkpoints/<workflow_id>/<millis>`, zero-padded so keys sort by time
    pub fn key(&self) -> String {
        format!("{}{:013}", workflow_prefix(&self.workflow_id), self.sequence)
    }
}

fn workflow_prefix(workflow_id: &str) -> String {
    format!("{}/{}/", CHECKPOINT_PREFIX, workflow_id)
}

pub fn write_checkpoint(store: &dyn StateStore, checkpoint: &Checkpoint) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| AgentvisorError::SerializationError(e.to_string()))?;
    store.put(&checkpoint.key(), &bytes)
}

/// Every checkpoint of a workflow, oldest first
pub fn list_checkpoints(store: &dyn StateStore, workflow_id: &str) -> Result<Vec<Checkpoint>> {
    store
        .list_by_prefix(&workflow_prefix(workflow_id))?
        .iter()
        .map(|key| read_checkpoint(store, key))
        .collect::<Result<Vec<_>>>()
        .map(|checkpoints| checkpoints.into_iter().flatten().collect())
}

pub fn latest_checkpoint(store: &dyn StateStore, workflow_id: &str) -> Result<Option<Checkpoint>> {
    match store.list_by_prefix(&workflow_prefix(workflow_id))?.last() {
        Some(key) => read_checkpoint(store, key),
        None => Ok(None),
    }
}

fn read_checkpoint(store: &dyn StateStore, key: &str) -> Result<Option<Checkpoint>> {
    store
        .get(key)?
        .map(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| {
                AgentvisorError::DeserializationError(format!("checkpoint {}: {}", key, e))
            })
        })
        .transpose()
}
