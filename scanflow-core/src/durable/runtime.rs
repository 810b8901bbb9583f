use std::{any::type_name, fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{Result, ScanflowError};

use super::{
    client::DurableClient,
    config::{QueueConfig, RuntimeConfig},
    context::WorkflowContext,
    record::WorkflowRecord,
    store::DurableStore,
    workflow::WorkflowRegistry,
};

/// Supervises queue pollers, workflow executions and lease housekeeping
/// inside a single executor process.
pub struct WorkflowRuntime<S: DurableStore + 'static> {
    config: RuntimeConfig,
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    queues: Vec<QueueConfig>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: DurableStore + 'static> fmt::Debug for WorkflowRuntime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkflowRuntime")
            .field("config", &self.config)
            .field("store_type", &type_name::<S>())
            .field("registry", &self.registry)
            .field("queues", &self.queues)
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<S: DurableStore + 'static> WorkflowRuntime<S> {
    pub fn new(config: RuntimeConfig, store: Arc<S>, registry: WorkflowRegistry) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(registry),
            queues: Vec::new(),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a named queue to poll. Must be called before [`Self::start`].
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.retain(|existing| existing.name != queue.name);
        self.queues.push(queue);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn client(&self) -> DurableClient<S> {
        DurableClient::new(self.store())
    }

    pub async fn start(&self) -> Result<()> {
        // A restart under the same identity owns nothing that is still running.
        let released = self
            .store
            .release_executor_leases(&self.config.executor_id)
            .await?;
        if released > 0 {
            info!(
                executor_id = %self.config.executor_id,
                released,
                "recovered workflows from previous incarnation"
            );
        }

        let mut queues = self.queues.clone();
        queues.push(self.config.direct_queue());
        for queue in queues {
            self.spawn_queue_poller(queue).await;
        }
        self.spawn_housekeeper().await;

        info!(
            executor_id = %self.config.executor_id,
            workflows = self.registry.len(),
            queues = self.queues.len() + 1,
            "workflow runtime started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown of workflow runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Runtime task failed: {:?}", e),
                Err(_) => warn!("Runtime task timed out during shutdown"),
            }
        }

        info!("Workflow runtime shutdown complete");
        Ok(())
    }

    fn executor(&self) -> Executor<S> {
        Executor {
            store: self.store(),
            registry: Arc::clone(&self.registry),
            executor_id: self.config.executor_id.clone(),
            lease: self.config.lease,
            shutdown: self.shutdown_token.clone(),
        }
    }

    async fn spawn_queue_poller(&self, queue: QueueConfig) {
        let executor = self.executor();
        let poll_interval = self.config.poll_interval();
        let shutdown = self.shutdown_token.clone();
        let slots = queue.worker_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));

        let handle = tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                match executor
                    .store
                    .claim_next(&queue, &executor.executor_id, executor.lease.ttl())
                    .await
                {
                    Ok(Some(record)) => {
                        let executor = executor.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            executor.execute(record).await;
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(err) => {
                        drop(permit);
                        warn!(queue = %queue.name, error = %err, "claim failed");
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }

            // Wait for in-flight executions to observe cancellation.
            let _ = semaphore.acquire_many(slots as u32).await;
            debug!(queue = %queue.name, "queue poller stopped");
        });

        self.worker_handles.lock().await.push(handle);
    }

    async fn spawn_housekeeper(&self) {
        let store = self.store();
        let interval = self.config.lease.housekeeper_interval();
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match store.expire_leases().await {
                            Ok(0) => {}
                            Ok(resurrected) => info!(resurrected, "requeued workflows with expired leases"),
                            Err(err) => warn!("housekeeper expire_leases error: {err}"),
                        }
                    }
                }
            }
        });

        self.worker_handles.lock().await.push(handle);
    }
}

struct Executor<S: DurableStore + 'static> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    executor_id: String,
    lease: super::config::LeaseConfig,
    shutdown: CancellationToken,
}

impl<S: DurableStore + 'static> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            executor_id: self.executor_id.clone(),
            lease: self.lease,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: DurableStore + 'static> Executor<S> {
    async fn execute(&self, record: WorkflowRecord) {
        let span = info_span!(
            "workflow",
            workflow_id = %record.id,
            workflow = %record.name,
            attempt = record.attempts
        );
        self.execute_inner(record).instrument(span).await
    }

    async fn execute_inner(&self, record: WorkflowRecord) {
        let workflow_id = record.id.clone();

        let Some(workflow) = self.registry.get(&record.name) else {
            let err = ScanflowError::UnknownWorkflow(record.name.clone());
            error!(error = %err, "no implementation registered");
            self.finish(&record, Err(err)).await;
            return;
        };

        let dyn_store: Arc<dyn DurableStore> = self.store.clone();
        let mut ctx = match WorkflowContext::load(workflow_id.clone(), dyn_store).await {
            Ok(ctx) => ctx,
            Err(err) => {
                self.finish(&record, Err(err)).await;
                return;
            }
        };

        let lease_lost = self.shutdown.child_token();
        let renewer = self.spawn_lease_renewer(&record, lease_lost.clone());

        let outcome = tokio::select! {
            _ = lease_lost.cancelled() => None,
            result = workflow.run_encoded(&mut ctx, record.input.clone()) => Some(result),
        };
        renewer.abort();

        let result = outcome.unwrap_or_else(|| {
            Err(ScanflowError::Cancelled(format!(
                "executor {} stopped running {workflow_id}",
                self.executor_id
            )))
        });
        self.finish(&record, result).await;
    }

    async fn finish(&self, record: &WorkflowRecord, result: Result<serde_json::Value>) {
        let stored = match result {
            Ok(output) => {
                debug!("workflow succeeded");
                self.store
                    .complete_workflow(&record.id, &self.executor_id, output)
                    .await
            }
            Err(err) if is_interruption(&err) => {
                warn!(error = %err, "execution interrupted; leaving workflow for recovery");
                return;
            }
            Err(err) => {
                warn!(error = %err, "workflow failed");
                self.store
                    .fail_workflow(&record.id, &self.executor_id, err.to_string())
                    .await
            }
        };
        if let Err(err) = stored {
            warn!(error = %err, "could not persist workflow outcome");
        }
    }

    fn spawn_lease_renewer(
        &self,
        record: &WorkflowRecord,
        lease_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let workflow_id = record.id.clone();
        let executor_id = self.executor_id.clone();
        let ttl = self.lease.ttl();
        let every = self.lease.renew_every();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lease_lost.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                match store.renew_lease(&workflow_id, &executor_id, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(workflow_id = %workflow_id, "lease lost; abandoning execution");
                        lease_lost.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(workflow_id = %workflow_id, error = %err, "lease renewal failed");
                    }
                }
            }
        })
    }
}

/// Errors that say nothing about the workflow itself: the instance stays
/// leased until it expires and another executor replays it. Domain conflicts
/// are not among them.
fn is_interruption(err: &ScanflowError) -> bool {
    match err {
        ScanflowError::Fenced(_) | ScanflowError::Cancelled(_) => true,
        #[cfg(feature = "postgres")]
        ScanflowError::Database(_) => true,
        _ => false,
    }
}
