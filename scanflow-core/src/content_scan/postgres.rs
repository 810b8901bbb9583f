use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::{fmt, str::FromStr};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ScanflowError};

use super::{
    record::ScanRecordStore,
    types::{CommunityServerId, FinalizeCounts, ScanId, ScanOutcome, ScanStatus},
};

/// Scan records in the `content_scans` table.
#[derive(Clone)]
pub struct PostgresScanRecordStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresScanRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresScanRecordStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct OutcomeRow {
    community_server_id: Uuid,
    status: String,
    messages_scanned: i64,
    messages_flagged: i64,
    messages_skipped: i64,
    total_errors: i64,
}

impl TryFrom<OutcomeRow> for ScanOutcome {
    type Error = ScanflowError;

    fn try_from(row: OutcomeRow) -> Result<Self> {
        Ok(ScanOutcome {
            status: ScanStatus::from_str(&row.status)?,
            messages_scanned: row.messages_scanned.max(0) as u64,
            messages_flagged: row.messages_flagged.max(0) as u64,
            messages_skipped: row.messages_skipped.max(0) as u64,
            total_errors: row.total_errors.max(0) as u64,
        })
    }
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PostgresScanRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a scan as pending ahead of dispatch.
    pub async fn create_pending(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_scans (scan_id, community_server_id, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (scan_id) DO NOTHING
            "#,
        )
        .bind(scan_id.to_uuid())
        .bind(community_server_id.to_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_outcome(&self, scan_id: ScanId) -> Result<Option<OutcomeRow>> {
        Ok(sqlx::query_as::<_, OutcomeRow>(
            r#"
            SELECT community_server_id, status, messages_scanned, messages_flagged,
                   messages_skipped, total_errors
            FROM content_scans
            WHERE scan_id = $1
            "#,
        )
        .bind(scan_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ScanRecordStore for PostgresScanRecordStore {
    async fn transition_to_in_progress(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
    ) -> Result<bool> {
        let transitioned = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO content_scans (scan_id, community_server_id, status, started_at, updated_at)
            VALUES ($1, $2, 'in_progress', NOW(), NOW())
            ON CONFLICT (scan_id) DO UPDATE
            SET status = 'in_progress', started_at = NOW(), updated_at = NOW()
            WHERE content_scans.status = 'pending'
              AND content_scans.community_server_id = EXCLUDED.community_server_id
            RETURNING scan_id
            "#,
        )
        .bind(scan_id.to_uuid())
        .bind(community_server_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;

        if transitioned.is_some() {
            return Ok(true);
        }
        match self.fetch_outcome(scan_id).await? {
            Some(row) if row.community_server_id != community_server_id.to_uuid() => {
                Err(ScanflowError::Conflict(format!(
                    "scan {scan_id} does not belong to community server {community_server_id}"
                )))
            }
            Some(row) => {
                debug!(scan_id = %scan_id, status = %row.status, "scan already started");
                Ok(false)
            }
            None => Err(ScanflowError::Internal(format!(
                "scan {scan_id} vanished during transition"
            ))),
        }
    }

    async fn finalize(
        &self,
        scan_id: ScanId,
        community_server_id: CommunityServerId,
        counts: FinalizeCounts,
    ) -> Result<ScanOutcome> {
        let status = counts.terminal_status();
        let updated = sqlx::query_as::<_, OutcomeRow>(
            r#"
            INSERT INTO content_scans (
                scan_id, community_server_id, status, messages_scanned, messages_flagged,
                messages_skipped, total_errors, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (scan_id) DO UPDATE
            SET status = EXCLUDED.status,
                messages_scanned = EXCLUDED.messages_scanned,
                messages_flagged = EXCLUDED.messages_flagged,
                messages_skipped = EXCLUDED.messages_skipped,
                total_errors = EXCLUDED.total_errors,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE content_scans.status IN ('pending', 'in_progress')
              AND content_scans.community_server_id = EXCLUDED.community_server_id
            RETURNING community_server_id, status, messages_scanned, messages_flagged,
                      messages_skipped, total_errors
            "#,
        )
        .bind(scan_id.to_uuid())
        .bind(community_server_id.to_uuid())
        .bind(status.as_str())
        .bind(count(counts.messages_scanned))
        .bind(count(counts.flagged_count))
        .bind(count(counts.skipped_count))
        .bind(count(counts.error_count))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.try_into();
        }

        let row = self.fetch_outcome(scan_id).await?.ok_or_else(|| {
            ScanflowError::Internal(format!("scan {scan_id} vanished during finalize"))
        })?;
        if row.community_server_id != community_server_id.to_uuid() {
            return Err(ScanflowError::Conflict(format!(
                "scan {scan_id} does not belong to community server {community_server_id}"
            )));
        }
        debug!(scan_id = %scan_id, status = %row.status, "scan already finalized");
        row.try_into()
    }
}
