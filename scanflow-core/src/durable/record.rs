use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::ScanflowError;

/// Stable identifier of one workflow instance. Also the deduplication key: a
/// second submission with the same id attaches to the existing instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkflowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle of a workflow instance. Enqueued/Running map directly to queue presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Enqueued => "enqueued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Succeeded | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ScanflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(WorkflowStatus::Enqueued),
            "running" => Ok(WorkflowStatus::Running),
            "succeeded" => Ok(WorkflowStatus::Succeeded),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(ScanflowError::Internal(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

/// Envelope stored in persistence for each workflow instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub queue: String,
    pub status: WorkflowStatus,
    /// Versioned input envelope (see [`crate::durable::codec`]).
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Number of times an executor has claimed this instance.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(new: NewWorkflow) -> Self {
        let now = Utc::now();
        Self {
            id: new.id,
            name: new.name,
            queue: new.queue,
            status: WorkflowStatus::Enqueued,
            input: new.input,
            output: None,
            error: None,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Insert request for a workflow instance.
#[derive(Clone, Debug)]
pub struct NewWorkflow {
    pub id: WorkflowId,
    pub name: String,
    pub queue: String,
    pub input: Value,
}

/// Result of an idempotent insert: either a fresh instance or the one already
/// registered under the same id.
#[derive(Clone, Debug)]
pub struct InsertOutcome {
    pub record: WorkflowRecord,
    pub created: bool,
}
