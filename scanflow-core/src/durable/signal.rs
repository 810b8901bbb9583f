use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;

use super::record::WorkflowId;

/// A point-to-point message addressed to `(workflow_id, topic)`.
///
/// Within a mailbox, ids increase monotonically and become visible in id
/// order: once a reader sees id `n`, no signal with a smaller id can appear
/// later. A consumer only needs to remember the last id it logged to know
/// where its mailbox resumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signal {
    pub id: u64,
    pub topic: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

/// Durable mailbox shared by producers and workflow instances.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Fire-and-forget delivery. A repeated `idempotency_key` is absorbed
    /// silently so replayed senders never double-deliver.
    async fn send(
        &self,
        destination: &WorkflowId,
        topic: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<()>;

    /// Oldest signal on `(workflow_id, topic)` with an id greater than `after`,
    /// waiting up to `timeout` for one to arrive. A zero timeout polls once.
    async fn next_signal(
        &self,
        workflow_id: &WorkflowId,
        topic: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<Signal>>;
}
