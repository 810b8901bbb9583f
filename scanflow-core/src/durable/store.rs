use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

use super::{
    config::QueueConfig,
    events::EventLog,
    record::{InsertOutcome, NewWorkflow, WorkflowId, WorkflowRecord},
    signal::SignalBus,
};

/// Abstracts the workflow registry + queue backend consumed by clients and
/// the runtime.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Idempotent on `new.id`: an existing instance is returned untouched with
    /// `created = false`.
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertOutcome>;

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>>;

    /// Lease the oldest enqueued instance of `queue` to `executor_id`, unless
    /// the queue's global ceiling is already reached.
    async fn claim_next(
        &self,
        queue: &QueueConfig,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<WorkflowRecord>>;

    /// Returns `false` when the executor no longer owns the lease.
    async fn renew_lease(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<bool>;

    async fn complete_workflow(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        output: Value,
    ) -> Result<()>;

    async fn fail_workflow(&self, id: &WorkflowId, executor_id: &str, error: String) -> Result<()>;

    /// Housekeeping: running instances whose lease lapsed go back to enqueued.
    /// Returns the number of instances resurrected.
    async fn expire_leases(&self) -> Result<u64>;

    /// Recovery: release every lease still held by a previous incarnation of
    /// `executor_id`.
    async fn release_executor_leases(&self, executor_id: &str) -> Result<u64>;
}

/// Marker trait for a backend that can host workflows end to end.
pub trait DurableStore: WorkflowStore + EventLog + SignalBus {}
impl<T> DurableStore for T where T: WorkflowStore + EventLog + SignalBus {}
