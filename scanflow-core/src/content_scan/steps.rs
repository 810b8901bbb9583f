//! Durable steps used by the content-scan workflows. Each one occupies a single
//! checkpointed slot in the calling workflow's history.

use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    durable::{RetryConfig, WorkflowContext},
    error::Result,
};

use super::{
    record::ScanRecordStore,
    scanner::ScanningService,
    types::{
        BatchResult, CommunityServerId, FinalizeCounts, MessageRecord, ScanId, ScanOutcome,
        ScanType,
    },
};

pub const CREATE_SCAN_RECORD_STEP: &str = "create_scan_record";
pub const FINALIZE_SCAN_STEP: &str = "finalize_scan";
pub const PROCESS_BATCH_STEP: &str = "process_batch";

/// Move the scan record to in-progress. `false` means another run already
/// started it, which is not an error.
pub async fn create_scan_record_step(
    ctx: &mut WorkflowContext,
    records: &Arc<dyn ScanRecordStore>,
    retry: &RetryConfig,
    scan_id: ScanId,
    community_server_id: CommunityServerId,
) -> Result<bool> {
    let transitioned = ctx
        .step_with_retry(CREATE_SCAN_RECORD_STEP, retry, || {
            let records = Arc::clone(records);
            async move {
                records
                    .transition_to_in_progress(scan_id, community_server_id)
                    .await
            }
        })
        .await?;
    debug!(scan_id = %scan_id, transitioned, "scan record in progress");
    Ok(transitioned)
}

/// Persist the final counters. Called once per scan, after the collection
/// loop has ended for whatever reason.
pub async fn finalize_scan_step(
    ctx: &mut WorkflowContext,
    records: &Arc<dyn ScanRecordStore>,
    retry: &RetryConfig,
    scan_id: ScanId,
    community_server_id: CommunityServerId,
    counts: FinalizeCounts,
) -> Result<ScanOutcome> {
    let outcome = ctx
        .step_with_retry(FINALIZE_SCAN_STEP, retry, || {
            let records = Arc::clone(records);
            async move { records.finalize(scan_id, community_server_id, counts).await }
        })
        .await?;
    info!(
        scan_id = %scan_id,
        status = %outcome.status,
        messages_scanned = outcome.messages_scanned,
        messages_flagged = outcome.messages_flagged,
        messages_skipped = outcome.messages_skipped,
        total_errors = outcome.total_errors,
        "scan finalized"
    );
    Ok(outcome)
}

/// Scan one batch. Never retried: the scanner's side effects are not safe to
/// repeat, so a failure is recorded and propagated as is.
pub async fn process_batch_step(
    ctx: &mut WorkflowContext,
    scanner: &Arc<dyn ScanningService>,
    community_server_id: CommunityServerId,
    batch_number: u32,
    messages: Vec<MessageRecord>,
    scan_types: Vec<ScanType>,
) -> Result<BatchResult> {
    let scanner = Arc::clone(scanner);
    ctx.step(PROCESS_BATCH_STEP, move || async move {
        let mut result = scanner
            .scan_batch(community_server_id, messages, scan_types)
            .await?;
        result.batch_number = batch_number;
        Ok(result)
    })
    .await
}
