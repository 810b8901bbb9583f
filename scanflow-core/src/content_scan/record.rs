use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, ScanflowError};

use super::types::{CommunityServerId, FinalizeCounts, ScanId, ScanOutcome, ScanStatus};

/// Persisted lifecycle of one bulk scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: ScanId,
    pub community_server_id: CommunityServerId,
    pub status: ScanStatus,
    pub messages_scanned: u64,
    pub messages_flagged: u64,
    pub messages_skipped: u64,
    pub total_errors: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanRecord {
    pub fn pending(scan_id: ScanId, community_server_id: CommunityServerId) -> Self {
        Self {
            scan_id,
            community_server_id,
            status: ScanStatus::Pending,
            messages_scanned: 0,
            messages_flagged: 0,
            messages_skipped: 0,
            total_errors: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn outcome(&self) -> ScanOutcome {
        ScanOutcome {
            status: self.status,
            messages_scanned: self.messages_scanned,
            messages_flagged: self.messages_flagged,
            messages_skipped: self.messages_skipped,
            total_errors: self.total_errors,
        }
    }

    fn apply_final(&mut self, counts: &FinalizeCounts) {
        self.status = counts.terminal_status();
        self.messages_scanned = counts.messages_scanned;
        self.messages_flagged = counts.flagged_count;
        self.messages_skipped = counts.skipped_count;
        self.total_errors = counts.error_count;
        self.completed_at = Some(Utc::now());
    }
}

/// Persistence for scan records. Both operations are idempotent so the
/// lifecycle steps may retry them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScanRecordStore: Send + Sync {
    /// Move a pending scan to in-progress, creating it when absent. Returns
    /// `false` when the scan had already left the pending state.
    async fn transition_to_in_progress(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
    ) -> Result<bool>;

    /// Persist the final counters and the derived terminal status. An
    /// already-terminal scan is returned unchanged.
    async fn finalize(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
        counts: FinalizeCounts,
    ) -> Result<ScanOutcome>;
}

fn tenant_mismatch(scan_id: ScanId, expected: CommunityServerId) -> ScanflowError {
    ScanflowError::Conflict(format!(
        "scan {scan_id} does not belong to community server {expected}"
    ))
}

#[derive(Debug, Default)]
pub struct InMemoryScanRecordStore {
    records: RwLock<HashMap<ScanId, ScanRecord>>,
}

impl InMemoryScanRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scan the way an API handler does before dispatching it.
    pub async fn create_pending(&self, scan_id: ScanId, community_server_id: CommunityServerId) {
        self.records
            .write()
            .await
            .entry(scan_id)
            .or_insert_with(|| ScanRecord::pending(scan_id, community_server_id));
    }

    pub async fn get(&self, scan_id: ScanId) -> Option<ScanRecord> {
        self.records.read().await.get(&scan_id).cloned()
    }
}

#[async_trait]
impl ScanRecordStore for InMemoryScanRecordStore {
    async fn transition_to_in_progress(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = records
            .entry(scan_id)
            .or_insert_with(|| ScanRecord::pending(scan_id, community_server_id));
        if record.community_server_id != community_server_id {
            return Err(tenant_mismatch(scan_id, community_server_id));
        }
        if !record.status.can_transition_to(ScanStatus::InProgress) {
            debug!(scan_id = %scan_id, status = %record.status, "scan already started");
            return Ok(false);
        }
        record.status = ScanStatus::InProgress;
        record.started_at = Utc::now();
        Ok(true)
    }

    async fn finalize(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
        counts: FinalizeCounts,
    ) -> Result<ScanOutcome> {
        let mut records = self.records.write().await;
        let record = records
            .entry(scan_id)
            .or_insert_with(|| ScanRecord::pending(scan_id, community_server_id));
        if record.community_server_id != community_server_id {
            return Err(tenant_mismatch(scan_id, community_server_id));
        }
        if record.status.is_terminal() {
            debug!(scan_id = %scan_id, status = %record.status, "scan already finalized");
            return Ok(record.outcome());
        }
        record.apply_final(&counts);
        Ok(record.outcome())
    }
}
