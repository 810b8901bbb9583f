//! Client-side entry points used by request handlers and message producers.
//!
//! All three fail soft: a transport or encoding error is logged and turned
//! into `None`/`false` so the calling request is never failed by background
//! orchestration.

use tracing::{debug, error, info, instrument, warn};

use crate::durable::{SubmitRequest, WorkflowClient, WorkflowId, codec};

use super::{
    batch::{ContentScanBatchInput, ContentScanBatchWorkflow},
    config::{ALL_TRANSMITTED_TOPIC, CONTENT_SCAN_QUEUE},
    orchestrator::{ContentScanInput, ContentScanOrchestrator},
    types::{CommunityServerId, MessageRecord, ScanId, ScanType, TransmissionNotice},
};

/// The orchestrator of a scan is addressed by the scan id itself, which also
/// makes re-dispatch idempotent.
pub fn scan_workflow_id(scan_id: ScanId) -> WorkflowId {
    WorkflowId::new(scan_id.to_string())
}

pub fn batch_workflow_id(scan_id: ScanId, batch_number: u32) -> WorkflowId {
    WorkflowId::new(format!("{scan_id}-batch-{batch_number}"))
}

/// Start the orchestrator for `scan_id`. A repeated call attaches to the
/// existing run and returns the same id.
#[instrument(skip(client, scan_types), fields(scan_type_count = scan_types.len()))]
pub async fn dispatch_content_scan_workflow<C: WorkflowClient + ?Sized>(
    client: &C,
    scan_id: ScanId,
    community_server_id: CommunityServerId,
    scan_types: &[ScanType],
) -> Option<WorkflowId> {
    let input = ContentScanInput {
        scan_id,
        community_server_id,
        scan_types: scan_types.to_vec(),
    };
    let input = match codec::encode(&input) {
        Ok(input) => input,
        Err(err) => {
            error!(scan_id = %scan_id, error = %err, "failed to encode content scan input");
            return None;
        }
    };

    let request = SubmitRequest::new(
        ContentScanOrchestrator::NAME,
        scan_workflow_id(scan_id),
        input,
    );
    match client.submit(request).await {
        Ok(submitted) => {
            if submitted.accepted {
                info!(scan_id = %scan_id, workflow_id = %submitted.workflow_id, "content scan dispatched");
            } else {
                info!(
                    scan_id = %scan_id,
                    workflow_id = %submitted.workflow_id,
                    status = %submitted.status,
                    "content scan already dispatched"
                );
            }
            Some(submitted.workflow_id)
        }
        Err(err) => {
            error!(scan_id = %scan_id, error = %err, "failed to dispatch content scan workflow");
            None
        }
    }
}

/// Queue one batch worker on `content_scan`.
#[instrument(
    skip(client, messages, scan_types),
    fields(message_count = messages.len())
)]
pub async fn enqueue_content_scan_batch<C: WorkflowClient + ?Sized>(
    client: &C,
    orchestrator_workflow_id: &WorkflowId,
    scan_id: ScanId,
    community_server_id: CommunityServerId,
    batch_number: u32,
    messages: Vec<MessageRecord>,
    scan_types: &[ScanType],
) -> Option<WorkflowId> {
    let input = ContentScanBatchInput {
        orchestrator_workflow_id: orchestrator_workflow_id.clone(),
        scan_id,
        community_server_id,
        batch_number,
        messages,
        scan_types: scan_types.to_vec(),
    };
    let input = match codec::encode(&input) {
        Ok(input) => input,
        Err(err) => {
            error!(scan_id = %scan_id, batch_number, error = %err, "failed to encode batch input");
            return None;
        }
    };

    let request = SubmitRequest::new(
        ContentScanBatchWorkflow::NAME,
        batch_workflow_id(scan_id, batch_number),
        input,
    )
    .on_queue(CONTENT_SCAN_QUEUE);
    match client.submit(request).await {
        Ok(submitted) => {
            debug!(
                scan_id = %scan_id,
                batch_number,
                workflow_id = %submitted.workflow_id,
                accepted = submitted.accepted,
                "content scan batch enqueued"
            );
            Some(submitted.workflow_id)
        }
        Err(err) => {
            error!(scan_id = %scan_id, batch_number, error = %err, "failed to enqueue content scan batch");
            None
        }
    }
}

/// Announce the total number of messages enqueued for a scan. `false` leaves
/// the orchestrator to finish on its receive timeout.
#[instrument(skip(client))]
pub async fn send_all_transmitted_signal<C: WorkflowClient + ?Sized>(
    client: &C,
    orchestrator_workflow_id: &WorkflowId,
    messages_scanned: u64,
) -> bool {
    let payload = match codec::encode(&TransmissionNotice { messages_scanned }) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to encode transmission notice");
            return false;
        }
    };
    match client
        .send_signal(orchestrator_workflow_id, ALL_TRANSMITTED_TOPIC, payload)
        .await
    {
        Ok(()) => {
            info!(messages_scanned, "all_transmitted signal sent");
            true
        }
        Err(err) => {
            warn!(messages_scanned, error = %err, "failed to send all_transmitted signal");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        durable::{
            DurableClient, InMemoryStore, QueueConfig, SignalBus, Submitted, WorkflowStatus,
            WorkflowStore,
        },
        error::{Result, ScanflowError},
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use uuid::Uuid;

    struct UnreachableClient;

    #[async_trait]
    impl WorkflowClient for UnreachableClient {
        async fn submit(&self, _request: SubmitRequest) -> Result<Submitted> {
            Err(ScanflowError::Internal("connection refused".into()))
        }

        async fn send_signal(
            &self,
            _destination: &WorkflowId,
            _topic: &str,
            _payload: Value,
        ) -> Result<()> {
            Err(ScanflowError::Internal("connection refused".into()))
        }
    }

    fn community() -> CommunityServerId {
        CommunityServerId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_on_scan_id() {
        let store = Arc::new(InMemoryStore::new());
        let client = DurableClient::new(Arc::clone(&store));
        let scan_id = ScanId::new();
        let community = community();

        let first =
            dispatch_content_scan_workflow(&client, scan_id, community, &[ScanType::Similarity])
                .await;
        let second =
            dispatch_content_scan_workflow(&client, scan_id, community, &[ScanType::Similarity])
                .await;

        assert_eq!(first, Some(scan_workflow_id(scan_id)));
        assert_eq!(first, second);
        let workflows = store.workflows().await;
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].name, ContentScanOrchestrator::NAME);
    }

    #[tokio::test]
    async fn batches_land_on_the_content_scan_queue() {
        let store = Arc::new(InMemoryStore::new());
        let client = DurableClient::new(Arc::clone(&store));
        let scan_id = ScanId::new();
        let orchestrator = scan_workflow_id(scan_id);

        let id = enqueue_content_scan_batch(
            &client,
            &orchestrator,
            scan_id,
            community(),
            3,
            Vec::new(),
            &[ScanType::ConversationFlashpoint],
        )
        .await
        .expect("enqueued");
        assert_eq!(id.as_str(), format!("{scan_id}-batch-3"));

        let claimed = store
            .claim_next(&QueueConfig::new(CONTENT_SCAN_QUEUE, 1), "w1", chrono::Duration::seconds(30))
            .await
            .unwrap()
            .expect("batch is claimable from content_scan");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, WorkflowStatus::Running);
        let decoded: ContentScanBatchInput = codec::decode(claimed.input).unwrap();
        assert_eq!(decoded.orchestrator_workflow_id, orchestrator);
        assert_eq!(decoded.batch_number, 3);
    }

    #[tokio::test]
    async fn all_transmitted_reaches_the_orchestrator_mailbox() {
        let store = Arc::new(InMemoryStore::new());
        let client = DurableClient::new(Arc::clone(&store));
        let orchestrator = WorkflowId::from("scan-x");

        assert!(send_all_transmitted_signal(&client, &orchestrator, 42).await);

        let signal = store
            .next_signal(&orchestrator, ALL_TRANSMITTED_TOPIC, 0, Duration::ZERO)
            .await
            .unwrap()
            .expect("notice delivered");
        let notice: TransmissionNotice = codec::decode(signal.payload).unwrap();
        assert_eq!(notice.messages_scanned, 42);
    }

    #[tokio::test]
    async fn helpers_fail_soft_when_the_client_is_down() {
        let client = UnreachableClient;
        let scan_id = ScanId::new();
        let orchestrator = scan_workflow_id(scan_id);

        assert!(
            dispatch_content_scan_workflow(&client, scan_id, community(), &[])
                .await
                .is_none()
        );
        assert!(
            enqueue_content_scan_batch(&client, &orchestrator, scan_id, community(), 1, Vec::new(), &[])
                .await
                .is_none()
        );
        assert!(!send_all_transmitted_signal(&client, &orchestrator, 10).await);
    }

    #[tokio::test]
    async fn helpers_accept_trait_objects() {
        let store = Arc::new(InMemoryStore::new());
        let client: Arc<dyn WorkflowClient> = Arc::new(DurableClient::new(store));
        let scan_id = ScanId::new();
        let id = dispatch_content_scan_workflow(client.as_ref(), scan_id, community(), &[]).await;
        assert_eq!(id, Some(scan_workflow_id(scan_id)));
    }
}
