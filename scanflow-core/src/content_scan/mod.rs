//! Bulk content-scan orchestration.
//!
//! A producer dispatches one [`ContentScanOrchestrator`] per scan, enqueues a
//! [`ContentScanBatchWorkflow`] per batch on the `content_scan` queue and
//! finally announces the total with [`send_all_transmitted_signal`]. Batch
//! workers report on `batch_complete`; the orchestrator finalizes the scan
//! record once.

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod orchestrator;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod scanner;
pub mod steps;
pub mod types;

use std::sync::Arc;

use crate::durable::WorkflowRegistry;

pub use batch::{ContentScanBatchInput, ContentScanBatchWorkflow};
pub use config::{
    ALL_TRANSMITTED_TOPIC, BATCH_COMPLETE_TOPIC, BATCH_RECV_TIMEOUT_SECONDS, CONTENT_SCAN_QUEUE,
    ContentScanConfig, POST_ALL_TRANSMITTED_TIMEOUT_SECONDS, content_scan_queue,
};
pub use dispatch::{
    batch_workflow_id, dispatch_content_scan_workflow, enqueue_content_scan_batch,
    scan_workflow_id, send_all_transmitted_signal,
};
pub use orchestrator::{ContentScanInput, ContentScanOrchestrator};
#[cfg(feature = "postgres")]
pub use postgres::PostgresScanRecordStore;
pub use record::{InMemoryScanRecordStore, ScanRecord, ScanRecordStore};
#[cfg(feature = "http-scanner")]
pub use scanner::HttpScanningService;
pub use scanner::ScanningService;
pub use types::{
    BatchResult, CommunityServerId, FinalizeCounts, MessageRecord, RunningTotals, ScanId,
    ScanOutcome, ScanStatus, ScanType, TransmissionNotice,
};

/// Register both content-scan workflows. The runtime must also poll
/// `config.queue` for batches to run.
pub fn register_content_scan_workflows(
    registry: &mut WorkflowRegistry,
    records: Arc<dyn ScanRecordStore>,
    scanner: Arc<dyn ScanningService>,
    config: ContentScanConfig,
) -> &mut WorkflowRegistry {
    registry
        .register(ContentScanOrchestrator::new(records, config))
        .register(ContentScanBatchWorkflow::new(scanner))
}
