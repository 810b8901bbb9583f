use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{debug, info, instrument, warn};

use crate::{
    durable::{Workflow, WorkflowContext},
    error::Result,
};

use super::{
    config::{ALL_TRANSMITTED_TOPIC, BATCH_COMPLETE_TOPIC, ContentScanConfig},
    record::ScanRecordStore,
    steps::{create_scan_record_step, finalize_scan_step},
    types::{
        BatchResult, CommunityServerId, RunningTotals, ScanId, ScanOutcome, ScanType,
        TransmissionNotice,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentScanInput {
    pub scan_id: ScanId,
    pub community_server_id: CommunityServerId,
    pub scan_types: Vec<ScanType>,
}

/// Scatter-gather coordinator for one scan.
///
/// Sums `batch_complete` results until the announced total is accounted for,
/// the announced total is zero, or a receive times out without progress. The
/// scan is then finalized once with whatever was collected.
pub struct ContentScanOrchestrator {
    records: Arc<dyn ScanRecordStore>,
    config: ContentScanConfig,
}

impl fmt::Debug for ContentScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentScanOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContentScanOrchestrator {
    pub const NAME: &'static str = "content_scan_orchestrator";

    pub fn new(records: Arc<dyn ScanRecordStore>, config: ContentScanConfig) -> Self {
        Self { records, config }
    }

    /// Non-blocking look at `all_transmitted`. Only the first notice counts.
    async fn check_notice(
        &self,
        ctx: &mut WorkflowContext,
        totals: &mut RunningTotals,
        scan_id: ScanId,
    ) -> Result<()> {
        match ctx.try_recv::<TransmissionNotice>(ALL_TRANSMITTED_TOPIC).await {
            Ok(Some(notice)) => {
                if totals.record_notice(&notice) {
                    info!(
                        scan_id = %scan_id,
                        messages_scanned = notice.messages_scanned,
                        accounted = totals.accounted(),
                        "all batches transmitted"
                    );
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) if err.is_payload_error() => {
                warn!(scan_id = %scan_id, error = %err, "discarding malformed transmission notice");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn collect(
        &self,
        ctx: &mut WorkflowContext,
        scan_id: ScanId,
    ) -> Result<RunningTotals> {
        let mut totals = RunningTotals::default();
        loop {
            if totals.expected_total.is_none() {
                self.check_notice(ctx, &mut totals, scan_id).await?;
            }
            if totals.is_complete() {
                break;
            }

            let timeout = self.config.recv_timeout(totals.expected_total.is_some());
            match ctx.recv::<BatchResult>(BATCH_COMPLETE_TOPIC, timeout).await {
                Ok(Some(batch)) => {
                    totals.absorb(&batch);
                    debug!(
                        scan_id = %scan_id,
                        batch_number = batch.batch_number,
                        processed = batch.processed,
                        skipped = batch.skipped,
                        errors = batch.errors,
                        flagged = batch.flagged_count,
                        accounted = totals.accounted(),
                        expected = ?totals.expected_total,
                        "batch result received"
                    );
                }
                Ok(None) => {
                    // A notice may have landed while we were blocked.
                    if totals.expected_total.is_none() {
                        self.check_notice(ctx, &mut totals, scan_id).await?;
                    }
                    warn!(
                        scan_id = %scan_id,
                        timeout_secs = timeout.as_secs(),
                        accounted = totals.accounted(),
                        expected = ?totals.expected_total,
                        "no batch progress before timeout; finalizing with partial totals"
                    );
                    break;
                }
                Err(err) if err.is_payload_error() => {
                    warn!(scan_id = %scan_id, error = %err, "discarding malformed batch result");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(expected) = totals.expected_total {
            if totals.accounted() > expected {
                warn!(
                    scan_id = %scan_id,
                    accounted = totals.accounted(),
                    expected,
                    "batch results exceed the announced total"
                );
            }
        }
        Ok(totals)
    }
}

#[async_trait]
impl Workflow for ContentScanOrchestrator {
    const NAME: &'static str = ContentScanOrchestrator::NAME;
    type Input = ContentScanInput;
    type Output = ScanOutcome;

    #[instrument(
        name = "content_scan_orchestrator",
        skip_all,
        fields(scan_id = %input.scan_id, community_server_id = %input.community_server_id)
    )]
    async fn run(&self, ctx: &mut WorkflowContext, input: ContentScanInput) -> Result<ScanOutcome> {
        let ContentScanInput {
            scan_id,
            community_server_id,
            scan_types,
        } = input;
        let retry = self.config.record_retry;

        let started = create_scan_record_step(
            ctx,
            &self.records,
            &retry,
            scan_id,
            community_server_id,
        )
        .await?;
        if !started {
            info!(scan_id = %scan_id, "scan record was already in progress");
        }

        let started_at = ctx.now().await?;
        debug!(scan_id = %scan_id, ?scan_types, %started_at, "collecting batch results");

        let totals = self.collect(ctx, scan_id).await?;

        let finished_at = ctx.now().await?;
        info!(
            scan_id = %scan_id,
            elapsed_secs = (finished_at - started_at).num_seconds(),
            complete = totals.is_complete(),
            "batch collection finished"
        );

        finalize_scan_step(
            ctx,
            &self.records,
            &retry,
            scan_id,
            community_server_id,
            totals.finalize_counts(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        content_scan::{
            record::{InMemoryScanRecordStore, MockScanRecordStore},
            types::{FinalizeCounts, ScanStatus},
        },
        durable::{
            DurableStore, EventKind, EventLog, InMemoryStore, RetryConfig, SignalBus, WorkflowId,
            codec,
        },
        error::ScanflowError,
    };
    use std::time::Duration;
    use tokio::{task::JoinHandle, time::Instant};
    use uuid::Uuid;

    fn input() -> ContentScanInput {
        ContentScanInput {
            scan_id: ScanId::new(),
            community_server_id: CommunityServerId(Uuid::new_v4()),
            scan_types: vec![ScanType::Similarity],
        }
    }

    fn config() -> ContentScanConfig {
        ContentScanConfig {
            record_retry: RetryConfig::none(),
            ..ContentScanConfig::default()
        }
    }

    fn batch(processed: u64, skipped: u64, errors: u64, flagged: u64, n: u32) -> BatchResult {
        BatchResult {
            processed,
            skipped,
            errors,
            flagged_count: flagged,
            batch_number: n,
        }
    }

    fn outcome_of(counts: FinalizeCounts) -> ScanOutcome {
        ScanOutcome::from_counts(counts.terminal_status(), &counts)
    }

    /// Record store that expects exactly one start and one finalize with
    /// `expected` counts.
    fn strict_records(expected: FinalizeCounts) -> Arc<dyn ScanRecordStore> {
        let mut records = MockScanRecordStore::new();
        records
            .expect_transition_to_in_progress()
            .times(1)
            .returning(|_, _| Ok(true));
        records
            .expect_finalize()
            .withf(move |_, _, counts| *counts == expected)
            .times(1)
            .returning(|_, _, counts| Ok(outcome_of(counts)));
        Arc::new(records)
    }

    async fn send_batch(store: &InMemoryStore, to: &WorkflowId, result: BatchResult) {
        store
            .send(to, BATCH_COMPLETE_TOPIC, codec::encode(&result).unwrap(), None)
            .await
            .unwrap();
    }

    async fn send_notice(store: &InMemoryStore, to: &WorkflowId, messages_scanned: u64) {
        let notice = TransmissionNotice { messages_scanned };
        store
            .send(to, ALL_TRANSMITTED_TOPIC, codec::encode(&notice).unwrap(), None)
            .await
            .unwrap();
    }

    fn spawn_run(
        store: &Arc<InMemoryStore>,
        records: Arc<dyn ScanRecordStore>,
        id: &WorkflowId,
        input: ContentScanInput,
    ) -> JoinHandle<Result<ScanOutcome>> {
        let store: Arc<dyn DurableStore> = store.clone();
        let id = id.clone();
        let orchestrator = ContentScanOrchestrator::new(records, config());
        tokio::spawn(async move {
            let mut ctx = WorkflowContext::load(id, store).await?;
            orchestrator.run(&mut ctx, input).await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn single_batch_matching_notice_finalizes_without_waiting() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-single");
        send_batch(&store, &id, batch(10, 0, 0, 2, 1)).await;
        send_notice(&store, &id, 10).await;

        let expected = FinalizeCounts {
            messages_scanned: 10,
            processed_count: 10,
            skipped_count: 0,
            error_count: 0,
            flagged_count: 2,
        };
        let started = Instant::now();
        let outcome = spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.messages_scanned, 10);
        assert_eq!(outcome.messages_flagged, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn three_batches_then_notice_sum_pointwise() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-three");
        send_batch(&store, &id, batch(5, 0, 1, 1, 1)).await;
        send_batch(&store, &id, batch(4, 0, 0, 2, 2)).await;
        send_batch(&store, &id, batch(3, 0, 1, 0, 3)).await;
        send_notice(&store, &id, 14).await;

        let expected = FinalizeCounts {
            messages_scanned: 14,
            processed_count: 12,
            skipped_count: 0,
            error_count: 2,
            flagged_count: 3,
        };
        let outcome = spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.total_errors, 2);
        assert_eq!(outcome.messages_flagged, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_order_does_not_change_totals() {
        let batches = [batch(5, 1, 0, 1, 1), batch(2, 0, 2, 0, 2), batch(7, 0, 0, 4, 3)];
        let expected = FinalizeCounts {
            messages_scanned: 17,
            processed_count: 14,
            skipped_count: 1,
            error_count: 2,
            flagged_count: 5,
        };

        for (run, order) in [[0usize, 1, 2], [2, 0, 1], [1, 2, 0]].into_iter().enumerate() {
            let store = Arc::new(InMemoryStore::new());
            let id = WorkflowId::new(format!("scan-order-{run}"));
            for idx in order {
                send_batch(&store, &id, batches[idx]).await;
            }
            send_notice(&store, &id, 17).await;

            let outcome = spawn_run(&store, strict_records(expected), &id, input())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome.messages_skipped, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scan_never_waits_on_batches() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-empty");
        send_notice(&store, &id, 0).await;

        let started = Instant::now();
        let outcome = spawn_run(
            &store,
            strict_records(FinalizeCounts::default()),
            &id,
            input(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(outcome.status, ScanStatus::Completed);
        let history = store.load_events(&id).await.unwrap();
        assert!(!history.iter().any(|event| matches!(
            &event.kind,
            EventKind::SignalReceived { topic, .. } if topic == BATCH_COMPLETE_TOPIC
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_after_pre_notice_budget() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-silent");

        let started = Instant::now();
        let outcome = spawn_run(
            &store,
            strict_records(FinalizeCounts::default()),
            &id,
            input(),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(600));
        assert_eq!(outcome.messages_scanned, 0);
        assert_eq!(outcome.status, ScanStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn post_notice_waits_use_the_shorter_budget() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-partial");
        send_notice(&store, &id, 10).await;
        send_batch(&store, &id, batch(4, 0, 0, 1, 1)).await;

        let expected = FinalizeCounts {
            messages_scanned: 10,
            processed_count: 4,
            flagged_count: 1,
            ..FinalizeCounts::default()
        };
        let started = Instant::now();
        let outcome = spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.messages_scanned, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn notice_racing_the_timeout_still_sets_messages_scanned() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-late-notice");
        send_batch(&store, &id, batch(3, 0, 0, 0, 1)).await;

        let expected = FinalizeCounts {
            messages_scanned: 5,
            processed_count: 3,
            ..FinalizeCounts::default()
        };
        let handle = spawn_run(&store, strict_records(expected), &id, input());

        // Blocked on batch_complete; the notice alone does not wake it.
        tokio::time::sleep(Duration::from_secs(30)).await;
        send_notice(&store, &id, 5).await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.messages_scanned, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn every_message_errored_is_failed() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-all-errors");
        send_notice(&store, &id, 3).await;
        send_batch(&store, &id, batch(0, 0, 3, 0, 1)).await;

        let expected = FinalizeCounts {
            messages_scanned: 3,
            error_count: 3,
            ..FinalizeCounts::default()
        };
        let outcome = spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, ScanStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_batch_payload_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-malformed");
        store
            .send(&id, BATCH_COMPLETE_TOPIC, serde_json::json!({"oops": true}), None)
            .await
            .unwrap();
        send_batch(&store, &id, batch(2, 0, 0, 0, 1)).await;
        send_notice(&store, &id, 2).await;

        let expected = FinalizeCounts {
            messages_scanned: 2,
            processed_count: 2,
            ..FinalizeCounts::default()
        };
        let started = Instant::now();
        spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_mid_loop_resumes_without_refinalizing() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-crash");
        let input = input();
        let expected = FinalizeCounts {
            messages_scanned: 8,
            processed_count: 8,
            flagged_count: 3,
            ..FinalizeCounts::default()
        };
        let records = strict_records(expected);

        send_batch(&store, &id, batch(5, 0, 0, 2, 1)).await;
        let first = spawn_run(&store, Arc::clone(&records), &id, input.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        send_batch(&store, &id, batch(3, 0, 0, 1, 2)).await;
        send_notice(&store, &id, 8).await;

        let outcome = spawn_run(&store, records, &id, input)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.messages_flagged, 3);
        assert_eq!(outcome.status, ScanStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn already_running_scan_is_not_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-rerun");
        let input = input();
        let records = Arc::new(InMemoryScanRecordStore::new());
        records
            .transition_to_in_progress(input.scan_id, input.community_server_id)
            .await
            .unwrap();
        send_notice(&store, &id, 0).await;

        let outcome = spawn_run(&store, records.clone(), &id, input.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, ScanStatus::Completed);
        let record = records.get(input.scan_id).await.unwrap();
        assert_eq!(record.status, ScanStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn overshooting_batches_still_finish_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-overshoot");
        send_notice(&store, &id, 5).await;
        send_batch(&store, &id, batch(6, 0, 1, 2, 1)).await;

        let expected = FinalizeCounts {
            messages_scanned: 5,
            processed_count: 6,
            skipped_count: 0,
            error_count: 1,
            flagged_count: 2,
        };
        let started = Instant::now();
        let outcome = spawn_run(&store, strict_records(expected), &id, input())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(outcome.messages_scanned, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_mismatch_fails_without_retrying() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let mut records = MockScanRecordStore::new();
        records
            .expect_transition_to_in_progress()
            .times(1)
            .returning(|scan_id, community_server_id| {
                Err(ScanflowError::Conflict(format!(
                    "scan {scan_id} does not belong to community server {community_server_id}"
                )))
            });
        records.expect_finalize().never();

        // The default policy retries transient failures several times.
        let orchestrator =
            ContentScanOrchestrator::new(Arc::new(records), ContentScanConfig::default());
        let mut ctx = WorkflowContext::load(WorkflowId::from("scan-tenant"), store)
            .await
            .unwrap();
        let started = Instant::now();
        let err = orchestrator.run(&mut ctx, input()).await.unwrap_err();

        assert!(matches!(err, ScanflowError::Conflict(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn record_store_failures_surface_after_retries() {
        let store = Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("scan-store-down");
        let mut records = MockScanRecordStore::new();
        records
            .expect_transition_to_in_progress()
            .times(1)
            .returning(|_, _| Err(ScanflowError::Internal("connection refused".into())));
        records.expect_finalize().never();

        let err = spawn_run(&store, Arc::new(records), &id, input())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ScanflowError::Internal(_)));
    }
}
