use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, instrument};

use crate::{
    durable::{Workflow, WorkflowContext, WorkflowId},
    error::Result,
};

use super::{
    config::BATCH_COMPLETE_TOPIC,
    scanner::ScanningService,
    steps::process_batch_step,
    types::{BatchResult, CommunityServerId, MessageRecord, ScanId, ScanType},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentScanBatchInput {
    /// Where `batch_complete` is delivered.
    pub orchestrator_workflow_id: WorkflowId,
    pub scan_id: ScanId,
    pub community_server_id: CommunityServerId,
    pub batch_number: u32,
    pub messages: Vec<MessageRecord>,
    pub scan_types: Vec<ScanType>,
}

/// Scans one batch and reports the result to its orchestrator.
///
/// A scanner failure fails this instance without signalling; the orchestrator
/// covers the gap with its receive timeout.
pub struct ContentScanBatchWorkflow {
    scanner: Arc<dyn ScanningService>,
}

impl fmt::Debug for ContentScanBatchWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentScanBatchWorkflow").finish_non_exhaustive()
    }
}

impl ContentScanBatchWorkflow {
    pub const NAME: &'static str = "content_scan_batch";

    pub fn new(scanner: Arc<dyn ScanningService>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl Workflow for ContentScanBatchWorkflow {
    const NAME: &'static str = ContentScanBatchWorkflow::NAME;
    type Input = ContentScanBatchInput;
    type Output = BatchResult;

    #[instrument(
        name = "content_scan_batch",
        skip_all,
        fields(scan_id = %input.scan_id, batch_number = input.batch_number)
    )]
    async fn run(&self, ctx: &mut WorkflowContext, input: ContentScanBatchInput) -> Result<BatchResult> {
        let ContentScanBatchInput {
            orchestrator_workflow_id,
            scan_id,
            community_server_id,
            batch_number,
            messages,
            scan_types,
        } = input;
        let message_count = messages.len();

        let result = process_batch_step(
            ctx,
            &self.scanner,
            community_server_id,
            batch_number,
            messages,
            scan_types,
        )
        .await?;

        ctx.send(&orchestrator_workflow_id, BATCH_COMPLETE_TOPIC, &result)
            .await?;
        debug!(
            scan_id = %scan_id,
            batch_number,
            messages = message_count,
            processed = result.processed,
            flagged = result.flagged_count,
            orchestrator = %orchestrator_workflow_id,
            "batch reported"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        content_scan::scanner::MockScanningService,
        durable::{DurableStore, InMemoryStore, SignalBus, codec},
        error::ScanflowError,
    };
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn message(n: u32) -> MessageRecord {
        MessageRecord {
            message_id: format!("m{n}"),
            channel_id: "c1".into(),
            community_server_id: "guild-1".into(),
            content: format!("message {n}"),
            author_id: "a1".into(),
            author_username: "alice".into(),
            timestamp: Utc::now(),
            attachment_urls: None,
            embed_content: None,
        }
    }

    fn input(orchestrator: &WorkflowId, batch_number: u32) -> ContentScanBatchInput {
        ContentScanBatchInput {
            orchestrator_workflow_id: orchestrator.clone(),
            scan_id: ScanId::new(),
            community_server_id: CommunityServerId(Uuid::new_v4()),
            batch_number,
            messages: (0..3).map(message).collect(),
            scan_types: vec![ScanType::Similarity, ScanType::OpenaiModeration],
        }
    }

    async fn run(
        store: &Arc<InMemoryStore>,
        scanner: Arc<dyn ScanningService>,
        id: &str,
        input: ContentScanBatchInput,
    ) -> Result<BatchResult> {
        let dyn_store: Arc<dyn DurableStore> = store.clone();
        let mut ctx = WorkflowContext::load(WorkflowId::from(id), dyn_store).await?;
        ContentScanBatchWorkflow::new(scanner).run(&mut ctx, input).await
    }

    #[tokio::test]
    async fn reports_result_to_orchestrator_and_returns_it() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = WorkflowId::from("scan-1");
        let mut scanner = MockScanningService::new();
        scanner
            .expect_scan_batch()
            .withf(|_, messages, scan_types| messages.len() == 3 && scan_types.len() == 2)
            .times(1)
            .returning(|_, _, _| {
                Ok(BatchResult {
                    processed: 3,
                    flagged_count: 1,
                    ..BatchResult::default()
                })
            });

        let result = run(&store, Arc::new(scanner), "scan-1-batch-4", input(&orchestrator, 4))
            .await
            .unwrap();
        assert_eq!(result.batch_number, 4);
        assert_eq!(result.processed, 3);

        let signal = store
            .next_signal(&orchestrator, BATCH_COMPLETE_TOPIC, 0, Duration::ZERO)
            .await
            .unwrap()
            .expect("batch_complete delivered");
        let delivered: BatchResult = codec::decode(signal.payload).unwrap();
        assert_eq!(delivered, result);
    }

    #[tokio::test]
    async fn scanner_failure_propagates_without_signal_or_retry() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = WorkflowId::from("scan-2");
        let mut scanner = MockScanningService::new();
        scanner
            .expect_scan_batch()
            .times(1)
            .returning(|_, _, _| Err(ScanflowError::Scanner("classifier timed out".into())));

        let err = run(&store, Arc::new(scanner), "scan-2-batch-1", input(&orchestrator, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanflowError::Scanner(_)));
        assert_eq!(store.signal_count(&orchestrator, BATCH_COMPLETE_TOPIC).await, 0);
    }

    #[tokio::test]
    async fn replay_does_not_rescan_or_resignal() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = WorkflowId::from("scan-3");
        let mut scanner = MockScanningService::new();
        scanner.expect_scan_batch().times(1).returning(|_, _, _| {
            Ok(BatchResult {
                processed: 2,
                skipped: 1,
                ..BatchResult::default()
            })
        });
        let scanner: Arc<dyn ScanningService> = Arc::new(scanner);
        let input = input(&orchestrator, 2);

        let first = run(&store, Arc::clone(&scanner), "scan-3-batch-2", input.clone())
            .await
            .unwrap();
        let replayed = run(&store, scanner, "scan-3-batch-2", input).await.unwrap();

        assert_eq!(first, replayed);
        assert_eq!(store.signal_count(&orchestrator, BATCH_COMPLETE_TOPIC).await, 1);
    }
}
