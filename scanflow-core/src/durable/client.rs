use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

use crate::error::{Result, ScanflowError};

use super::{
    codec,
    config::DIRECT_QUEUE,
    record::{NewWorkflow, WorkflowId, WorkflowRecord, WorkflowStatus},
    signal::SignalBus,
    store::{DurableStore, WorkflowStore},
    workflow::Workflow,
};

/// High-level submit request used by upstream producers and request handlers.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub workflow_name: String,
    pub workflow_id: WorkflowId,
    /// Versioned input envelope.
    pub input: Value,
    /// `None` starts the instance on the direct queue.
    pub queue: Option<String>,
}

impl SubmitRequest {
    pub fn new(workflow_name: impl Into<String>, workflow_id: WorkflowId, input: Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            workflow_id,
            input,
            queue: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// Lightweight summary returned to callers after submit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submitted {
    pub workflow_id: WorkflowId,
    /// `false` when the id was already registered and the request was absorbed.
    pub accepted: bool,
    pub status: WorkflowStatus,
}

/// Capability handed to code that starts workflows or signals them from
/// outside any workflow.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> Result<Submitted>;

    async fn send_signal(&self, destination: &WorkflowId, topic: &str, payload: Value)
    -> Result<()>;
}

/// [`WorkflowClient`] backed directly by a [`DurableStore`].
pub struct DurableClient<S: DurableStore + 'static> {
    store: Arc<S>,
}

impl<S: DurableStore + 'static> Clone for DurableClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DurableStore + 'static> fmt::Debug for DurableClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableClient")
            .field("store", &std::any::type_name::<S>())
            .finish()
    }
}

impl<S: DurableStore + 'static> DurableClient<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Typed start of a registered workflow.
    pub async fn start<W: Workflow>(
        &self,
        workflow_id: WorkflowId,
        input: &W::Input,
        queue: Option<&str>,
    ) -> Result<WorkflowHandle<S>> {
        let mut request = SubmitRequest::new(W::NAME, workflow_id, codec::encode(input)?);
        request.queue = queue.map(str::to_string);
        let submitted = self.submit(request).await?;
        Ok(self.handle(submitted.workflow_id))
    }

    pub fn handle(&self, workflow_id: WorkflowId) -> WorkflowHandle<S> {
        WorkflowHandle {
            workflow_id,
            store: Arc::clone(&self.store),
        }
    }
}

#[async_trait]
impl<S: DurableStore + 'static> WorkflowClient for DurableClient<S> {
    async fn submit(&self, request: SubmitRequest) -> Result<Submitted> {
        let outcome = self
            .store
            .insert_workflow(NewWorkflow {
                id: request.workflow_id,
                name: request.workflow_name,
                queue: request.queue.unwrap_or_else(|| DIRECT_QUEUE.to_string()),
                input: request.input,
            })
            .await?;
        if !outcome.created {
            debug!(
                workflow_id = %outcome.record.id,
                status = %outcome.record.status,
                "submit absorbed by existing workflow"
            );
        }
        Ok(Submitted {
            workflow_id: outcome.record.id,
            accepted: outcome.created,
            status: outcome.record.status,
        })
    }

    async fn send_signal(
        &self,
        destination: &WorkflowId,
        topic: &str,
        payload: Value,
    ) -> Result<()> {
        self.store.send(destination, topic, payload, None).await
    }
}

/// Observes a single workflow instance from outside.
pub struct WorkflowHandle<S: DurableStore + 'static> {
    workflow_id: WorkflowId,
    store: Arc<S>,
}

impl<S: DurableStore + 'static> fmt::Debug for WorkflowHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

impl<S: DurableStore + 'static> WorkflowHandle<S> {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub async fn record(&self) -> Result<WorkflowRecord> {
        self.store
            .get_workflow(&self.workflow_id)
            .await?
            .ok_or_else(|| ScanflowError::NotFound(format!("workflow {}", self.workflow_id)))
    }

    pub async fn status(&self) -> Result<WorkflowStatus> {
        Ok(self.record().await?.status)
    }

    /// Wait up to `timeout` for the instance to finish and decode its output.
    /// `Ok(None)` means it was still in flight when the wait expired.
    pub async fn result<T: DeserializeOwned>(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.record().await?;
            match record.status {
                WorkflowStatus::Succeeded => {
                    let output = record.output.ok_or_else(|| {
                        ScanflowError::Internal(format!(
                            "workflow {} succeeded without output",
                            self.workflow_id
                        ))
                    })?;
                    return codec::decode(output).map(Some);
                }
                WorkflowStatus::Failed => {
                    return Err(ScanflowError::WorkflowFailed {
                        workflow_id: self.workflow_id.to_string(),
                        error: record.error.unwrap_or_default(),
                    });
                }
                WorkflowStatus::Enqueued | WorkflowStatus::Running => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((tokio::time::Instant::now() + Self::POLL_INTERVAL).min(deadline))
                .await;
        }
    }
}
