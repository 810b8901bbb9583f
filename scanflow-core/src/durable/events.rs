use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

use super::record::WorkflowId;

/// One durable action taken by a workflow, addressed by its position in the
/// instance's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub recorded_at: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            kind,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StepCompleted {
        name: String,
        output: Value,
    },
    StepFailed {
        name: String,
        error: String,
    },
    ClockRead {
        at: DateTime<Utc>,
    },
    /// `signal_id`/`payload` are `None` when the receive timed out.
    SignalReceived {
        topic: String,
        signal_id: Option<u64>,
        payload: Option<Value>,
    },
    SignalSent {
        destination: WorkflowId,
        topic: String,
    },
}

impl EventKind {
    /// Short label used in replay divergence errors and logs.
    pub fn label(&self) -> String {
        match self {
            EventKind::StepCompleted { name, .. } | EventKind::StepFailed { name, .. } => {
                format!("step:{name}")
            }
            EventKind::ClockRead { .. } => "clock".to_string(),
            EventKind::SignalReceived { topic, .. } => format!("recv:{topic}"),
            EventKind::SignalSent { destination, topic } => {
                format!("send:{destination}:{topic}")
            }
        }
    }
}

/// Append-only per-instance history. Appends are conditional on the sequence
/// slot being free so that two executors racing on the same instance cannot
/// both commit the same step.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn load_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>>;

    /// Returns [`crate::error::ScanflowError::Fenced`] when `event.seq` is
    /// already occupied or is not the next free slot.
    async fn append_event(&self, workflow_id: &WorkflowId, event: WorkflowEvent) -> Result<()>;
}
